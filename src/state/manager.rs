// ============================================================================
// State Manager Record
// ============================================================================
//
// One StateManager exists per managed instance. It records identity,
// version, the loaded/dirty field maps and the lifecycle stage, together with
// the activity marker and the re-entrancy guards used while user callbacks
// run in the middle of an operation. The operations that drive it live in
// the engine module; this file only holds the record and its pure queries.
//
// Invariant: dirty ⊆ loaded.
//
// ============================================================================

use super::{InstanceId, LifecycleStage};
use crate::core::{FieldBitSet, FieldValue, ObjectHandle, ObjectId, Version};
use crate::metadata::ClassMetadata;
use std::sync::Arc;

/// What the state manager is in the middle of doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Activity {
    #[default]
    None,
    /// The insert itself is running
    Inserting,
    /// Pre-store callbacks of an insert are running
    InsertingCallbacks,
    Deleting,
}

impl Activity {
    pub fn is_inserting(&self) -> bool {
        matches!(self, Activity::Inserting | Activity::InsertingCallbacks)
    }
}

/// Re-entrancy guards
#[derive(Debug, Clone, Default)]
pub(crate) struct ProcessFlags {
    pub flushing: bool,
    pub changing_state: bool,
    pub detaching: bool,
    pub attaching: bool,
    pub disconnecting: bool,
    pub post_load_pending: bool,
    pub flushed_new: bool,
    pub flushed_deleted: bool,
}

/// Field values captured at enlistment, restored on rollback
#[derive(Debug, Clone)]
pub(crate) struct SavedState {
    pub values: Vec<FieldValue>,
    pub loaded: FieldBitSet,
}

/// Owning field of an embedded object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmbeddedOwner {
    pub owner: ObjectHandle,
    pub field: usize,
}

#[derive(Debug)]
pub struct StateManager {
    pub(crate) class: Arc<ClassMetadata>,
    pub(crate) handle: ObjectHandle,
    pub(crate) instance: InstanceId,
    pub(crate) id: Option<ObjectId>,
    pub(crate) version: Option<Version>,
    pub(crate) stage: LifecycleStage,
    pub(crate) loaded: FieldBitSet,
    pub(crate) dirty: FieldBitSet,
    pub(crate) pre_delete_loaded: Option<FieldBitSet>,
    pub(crate) saved: Option<SavedState>,
    pub(crate) activity: Activity,
    pub(crate) flags: ProcessFlags,
    pub(crate) embedded_owner: Option<EmbeddedOwner>,
    /// Detached identity being merged into this object during attach
    pub(crate) attached_from: Option<ObjectId>,
}

impl StateManager {
    fn blank(
        class: Arc<ClassMetadata>,
        handle: ObjectHandle,
        instance: InstanceId,
        stage: LifecycleStage,
        loaded: FieldBitSet,
    ) -> Self {
        let count = class.field_count();
        Self {
            class,
            handle,
            instance,
            id: None,
            version: None,
            stage,
            loaded,
            dirty: FieldBitSet::new(count),
            pre_delete_loaded: None,
            saved: None,
            activity: Activity::None,
            flags: ProcessFlags::default(),
            embedded_owner: None,
            attached_from: None,
        }
    }

    /// A transient instance that has just been made persistent
    pub(crate) fn for_persistent_new(
        class: Arc<ClassMetadata>,
        handle: ObjectHandle,
        instance: InstanceId,
    ) -> Self {
        let loaded = class.all_fields();
        Self::blank(class, handle, instance, LifecycleStage::PersistentNew, loaded)
    }

    /// A datastore object known only by identity
    pub(crate) fn for_hollow(
        class: Arc<ClassMetadata>,
        handle: ObjectHandle,
        instance: InstanceId,
        id: ObjectId,
    ) -> Self {
        let loaded = FieldBitSet::from_fields(class.field_count(), class.primary_key_fields());
        let mut sm = Self::blank(class, handle, instance, LifecycleStage::Hollow, loaded);
        sm.id = Some(id);
        sm
    }

    /// A datastore object whose `loaded` fields are already materialized
    /// (backend row or second-level cache snapshot)
    pub(crate) fn for_persistent_clean(
        class: Arc<ClassMetadata>,
        handle: ObjectHandle,
        instance: InstanceId,
        id: ObjectId,
        version: Option<Version>,
        loaded: FieldBitSet,
    ) -> Self {
        let mut sm = Self::blank(class, handle, instance, LifecycleStage::PersistentClean, loaded);
        sm.id = Some(id);
        sm.version = version;
        sm
    }

    /// An embedded object owned by `owner`; it is always fully materialized
    pub(crate) fn for_embedded(
        class: Arc<ClassMetadata>,
        handle: ObjectHandle,
        instance: InstanceId,
        owner: EmbeddedOwner,
        stage: LifecycleStage,
    ) -> Self {
        let loaded = class.all_fields();
        let mut sm = Self::blank(class, handle, instance, stage, loaded);
        sm.embedded_owner = Some(owner);
        sm
    }

    /// A transient instance registered for rollback support only
    pub(crate) fn for_transactional(
        class: Arc<ClassMetadata>,
        handle: ObjectHandle,
        instance: InstanceId,
    ) -> Self {
        let loaded = class.all_fields();
        Self::blank(class, handle, instance, LifecycleStage::TransientClean, loaded)
    }

    pub fn class_metadata(&self) -> &Arc<ClassMetadata> {
        &self.class
    }

    pub fn handle(&self) -> ObjectHandle {
        self.handle
    }

    pub fn object_id(&self) -> Option<&ObjectId> {
        self.id.as_ref()
    }

    pub fn version(&self) -> Option<&Version> {
        self.version.as_ref()
    }

    pub fn stage(&self) -> LifecycleStage {
        self.stage
    }

    pub fn activity(&self) -> Activity {
        self.activity
    }

    pub fn loaded_fields(&self) -> &FieldBitSet {
        &self.loaded
    }

    pub fn dirty_fields(&self) -> &FieldBitSet {
        &self.dirty
    }

    pub fn pre_delete_loaded_fields(&self) -> Option<&FieldBitSet> {
        self.pre_delete_loaded.as_ref()
    }

    pub fn embedded_owner(&self) -> Option<EmbeddedOwner> {
        self.embedded_owner
    }

    pub fn is_embedded(&self) -> bool {
        self.embedded_owner.is_some()
    }

    pub fn is_flushed_new(&self) -> bool {
        self.flags.flushed_new
    }

    pub fn is_flushing(&self) -> bool {
        self.flags.flushing
    }

    pub fn is_detaching(&self) -> bool {
        self.flags.detaching
    }

    pub fn is_attaching(&self) -> bool {
        self.flags.attaching
    }

    pub fn is_changing_state(&self) -> bool {
        self.flags.changing_state
    }

    pub fn is_post_load_pending(&self) -> bool {
        self.flags.post_load_pending
    }

    pub fn is_new(&self) -> bool {
        self.stage.is_new()
    }

    pub fn is_deleted(&self) -> bool {
        self.stage.is_deleted()
    }

    /// Something remains to be sent to the datastore for this object
    pub fn is_dirty(&self) -> bool {
        if self.is_embedded() {
            return false;
        }
        match self.stage {
            LifecycleStage::PersistentNew => !self.flags.flushed_new || !self.dirty.is_empty(),
            LifecycleStage::PersistentDeleted => !self.flags.flushed_deleted,
            LifecycleStage::PersistentNewDeleted => {
                self.flags.flushed_new && !self.flags.flushed_deleted
            }
            LifecycleStage::PersistentClean
            | LifecycleStage::PersistentDirty
            | LifecycleStage::Hollow => !self.dirty.is_empty(),
            _ => false,
        }
    }

    /// Hot-path check: the in-memory value can be used without any further test
    #[inline]
    pub(crate) fn is_loaded_fast(&self, field: usize) -> bool {
        self.pre_delete_loaded.is_none() && self.loaded.get(field)
    }

    /// dirty ⊆ loaded
    pub fn invariants_hold(&self) -> bool {
        self.dirty.is_subset_of(&self.loaded)
    }

    /// Unloaded fields of the default fetch group
    pub(crate) fn unloaded_dfg_fields(&self) -> FieldBitSet {
        self.class.default_fetch_group_fields().difference(&self.loaded)
    }

    /// Label used in errors and log events
    pub fn describe(&self) -> String {
        match &self.id {
            Some(id) => id.to_string(),
            None => format!("{}{}", self.class.name, self.handle),
        }
    }

    pub(crate) fn field_label(&self, field: usize) -> String {
        self.class.field_name(field).to_string()
    }
}
