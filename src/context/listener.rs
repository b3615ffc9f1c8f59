// ============================================================================
// Lifecycle Listeners
// ============================================================================
//
// Callbacks fired by the engine around lifecycle operations. A listener gets
// a ListenerContext through which it may read and write the object; writes
// go through normal field mediation, so a write made from a pre-store
// callback during insert settles into the inserted state instead of causing
// a follow-up update.
//
// ============================================================================

use super::ExecutionContext;
use crate::core::{FieldValue, ObjectHandle, Result};
use crate::engine::FieldSelector;
use crate::state::{LifecycleStage, Persistable};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallbackEvent {
    Create,
    Load,
    PreStore,
    PostStore,
    PreClear,
    PostClear,
    PreDelete,
    PostDelete,
    PreDirty,
    PostDirty,
    PreDetach,
    PostDetach,
    PreAttach,
    PostAttach,
}

impl fmt::Display for CallbackEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CallbackEvent::Create => "create",
            CallbackEvent::Load => "load",
            CallbackEvent::PreStore => "pre-store",
            CallbackEvent::PostStore => "post-store",
            CallbackEvent::PreClear => "pre-clear",
            CallbackEvent::PostClear => "post-clear",
            CallbackEvent::PreDelete => "pre-delete",
            CallbackEvent::PostDelete => "post-delete",
            CallbackEvent::PreDirty => "pre-dirty",
            CallbackEvent::PostDirty => "post-dirty",
            CallbackEvent::PreDetach => "pre-detach",
            CallbackEvent::PostDetach => "post-detach",
            CallbackEvent::PreAttach => "pre-attach",
            CallbackEvent::PostAttach => "post-attach",
        };
        f.write_str(name)
    }
}

pub trait LifecycleListener: Send + Sync {
    fn on_event(&self, event: CallbackEvent, object: &mut ListenerContext<'_>) -> Result<()>;

    /// Classes this listener wants events for; `None` means all
    fn classes(&self) -> Option<&[&'static str]> {
        None
    }
}

/// The object a callback is running for
pub struct ListenerContext<'a> {
    ctx: &'a mut ExecutionContext,
    handle: ObjectHandle,
}

impl<'a> ListenerContext<'a> {
    pub(crate) fn new(ctx: &'a mut ExecutionContext, handle: ObjectHandle) -> Self {
        Self { ctx, handle }
    }

    pub fn handle(&self) -> ObjectHandle {
        self.handle
    }

    pub fn class_name(&self) -> Result<&'static str> {
        Ok(self.ctx.state_manager(self.handle)?.class_metadata().name)
    }

    pub fn stage(&self) -> Result<LifecycleStage> {
        self.ctx.stage(self.handle)
    }

    pub fn get_field(&mut self, field: impl FieldSelector) -> Result<FieldValue> {
        self.ctx.get_field(self.handle, field)
    }

    pub fn set_field(&mut self, field: impl FieldSelector, value: impl Into<FieldValue>) -> Result<()> {
        self.ctx.set_field(self.handle, field, value.into())
    }

    /// Direct view of the instance, without loading anything
    pub fn object<T: Persistable>(&self) -> Option<&T> {
        self.ctx.peek::<T>(self.handle)
    }

    pub fn context(&mut self) -> &mut ExecutionContext {
        self.ctx
    }
}
