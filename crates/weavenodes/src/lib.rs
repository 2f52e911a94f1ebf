//! Standard node library
//!
//! Collection of built-in nodes for common operations

mod debug;
mod time;
mod transform;
mod trigger;

pub use debug::{DebugNode, DebugNodeFactory};
pub use time::{DelayNode, DelayNodeFactory};
pub use transform::{
    JsonParseNode, JsonParseNodeFactory, JsonStringifyNode, JsonStringifyNodeFactory,
};
pub use trigger::{ManualTriggerNode, ManualTriggerNodeFactory};
use weaveruntime::NodeRegistry;

use std::sync::Arc;

/// Register all standard nodes with a registry
pub fn register_all(registry: &mut NodeRegistry) {
    registry.register(Arc::new(trigger::ManualTriggerNodeFactory));
    registry.register(Arc::new(debug::DebugNodeFactory));
    registry.register(Arc::new(transform::JsonParseNodeFactory));
    registry.register(Arc::new(transform::JsonStringifyNodeFactory));
    registry.register(Arc::new(time::DelayNodeFactory));
}
