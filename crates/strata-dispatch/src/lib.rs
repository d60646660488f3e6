//! # strata-dispatch
//!
//! Tiered placement and offload orchestration for strata module trees.
//!
//! A *device map* assigns subtrees of a model to memory tiers: accelerator
//! memory, host RAM, or disk. [`dispatch_model`] installs forward hooks that
//! materialize each submodule's weights on its execution device right before
//! its computation and evict offloaded weights back to meta placeholders
//! afterwards, so models larger than any single tier still run. Tied
//! parameters are deduplicated so each underlying allocation moves at most
//! once per device.
//!
//! Entry points:
//! - [`cpu_offload`] / [`disk_offload`] — whole-model offload with per-call
//!   materialization.
//! - [`dispatch_model`] — place a model according to an explicit device map.
//! - [`load_checkpoint_and_dispatch`] — load a safetensors checkpoint
//!   directly into tiers, then dispatch.
//! - [`cpu_offload_with_hook`] — chained pipelines where models take turns
//!   on the execution device.
//! - [`attach_layerwise_casting_hooks`] — low-precision storage with
//!   higher-precision compute.

pub mod auto;
pub mod casting;
pub mod checkpoint;
pub mod device_map;
pub mod dispatch;
pub mod error;
pub mod hooks;
pub mod model;
pub mod placement;
pub mod sequential;
pub mod tied;
pub mod weights;

pub use auto::{infer_auto_device_map, MemoryBudget};
pub use casting::{attach_layerwise_casting_hooks, CastAction, DEFAULT_CASTABLE_CLASSES};
pub use checkpoint::load_checkpoint_in_model;
pub use device_map::{check_device_map, resolve_tier, DeviceMap, NormalizedDeviceMap, Tier};
pub use dispatch::{
    cpu_offload, disk_offload, dispatch_model, load_checkpoint_and_dispatch, DeviceMapSpec,
    DispatchOptions, LoadOptions,
};
pub use error::{DispatchError, Result};
pub use hooks::{
    attach_align_device_hook, attach_hooks_on_blocks, attach_io_hook, AlignDeviceHook,
    AttachOptions,
};
pub use model::DispatchedModel;
pub use placement::set_module_tensor_to_device;
pub use sequential::{cpu_offload_with_hook, OffloadHandle};
pub use tied::{find_tied_parameters, retie_parameters, TieGroup, TiedParamMap};
pub use weights::{extract_submodule_state, offload_state_dict, OffloadIndex, WeightsMap};
