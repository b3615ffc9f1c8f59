// ============================================================================
// Store Provider
// ============================================================================
//
// ObjectProvider handed to persistence handlers. It reads the managed object
// straight out of the arena and converts each value to its store form:
//
// - managed references become identity tokens
// - embedded objects become inline EmbeddedValues
// - tracked containers become plain containers
// - field converters are applied last
//
// A reference to an object that has no identity yet fails the operation with
// NotYetFlushed, or, when unresolved references are being deferred, is sent
// as null and remembered so the field can be updated once the target exists.
// Everything the handler reports back is buffered and applied by the engine
// after the call.
//
// ============================================================================

use super::{ObjectArena, TransactionId};
use crate::core::{
    EmbeddedValue, FieldBitSet, FieldValue, ObjectHandle, ObjectId, ObjectRef, PersistenceError,
    Result, Version,
};
use crate::metadata::ClassMetadata;
use crate::store::ObjectProvider;
use crate::types::TypeRegistry;
use std::cell::RefCell;
use std::sync::Arc;

/// Treatment of references whose target has no identity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Unresolved {
    Fail,
    Null,
    /// Drop the whole value (second-level cache)
    Skip,
}

/// Converts in-memory values into their context-free form
pub(crate) struct Externalizer<'a> {
    pub arena: &'a ObjectArena,
    pub unresolved: Unresolved,
    pub inline_embedded: bool,
}

impl Externalizer<'_> {
    /// Context-free form of `value`, and whether some reference was unresolved.
    /// The value is `None` when it had to be skipped.
    pub fn value(&self, owner: &str, value: FieldValue) -> Result<(Option<FieldValue>, bool)> {
        let mut unresolved = false;
        let mut skipped = false;
        let out = value.try_map_refs(&mut |r| self.reference(owner, r, &mut unresolved, &mut skipped))?;
        Ok((if skipped { None } else { Some(out) }, unresolved))
    }

    fn reference(
        &self,
        owner: &str,
        r: ObjectRef,
        unresolved: &mut bool,
        skipped: &mut bool,
    ) -> Result<FieldValue> {
        match r {
            ObjectRef::Id(id) => Ok(FieldValue::Ref(ObjectRef::Id(id))),
            ObjectRef::Managed(h) => {
                let slot = self.arena.get(h)?;
                if slot.sm.is_embedded() {
                    if !self.inline_embedded {
                        *skipped = true;
                        return Ok(FieldValue::Null);
                    }
                    let mut fields = Vec::with_capacity(slot.sm.class.field_count());
                    for field in 0..slot.sm.class.field_count() {
                        let (value, nested) =
                            self.value(owner, slot.object.provide_field(field))?;
                        *unresolved |= nested;
                        match value {
                            Some(v) => fields.push(v),
                            None => {
                                *skipped = true;
                                fields.push(FieldValue::Null);
                            }
                        }
                    }
                    return Ok(FieldValue::Embedded(EmbeddedValue {
                        class: slot.sm.class.name,
                        fields,
                    }));
                }
                match &slot.sm.id {
                    Some(id) => Ok(FieldValue::Ref(ObjectRef::Id(id.clone()))),
                    None => self.unresolved(owner, slot.sm.describe(), unresolved, skipped),
                }
            }
            ObjectRef::Owned(obj) => {
                self.unresolved(owner, obj.class_name().to_string(), unresolved, skipped)
            }
        }
    }

    fn unresolved(
        &self,
        owner: &str,
        pending: String,
        unresolved: &mut bool,
        skipped: &mut bool,
    ) -> Result<FieldValue> {
        *unresolved = true;
        match self.unresolved {
            Unresolved::Fail => Err(PersistenceError::NotYetFlushed {
                object: owner.to_string(),
                pending,
            }),
            Unresolved::Null => Ok(FieldValue::Null),
            Unresolved::Skip => {
                *skipped = true;
                Ok(FieldValue::Null)
            }
        }
    }
}

/// What a handler call reported back
#[derive(Debug, Default)]
pub(crate) struct ProviderOutcome {
    pub fetched: Vec<(usize, FieldValue)>,
    pub new_id: Option<ObjectId>,
    pub fetched_version: Option<Option<Version>>,
    /// Fields sent as null because a referenced object had no identity yet
    pub nulled: FieldBitSet,
}

pub(crate) struct StoreProvider<'a> {
    arena: &'a ObjectArena,
    types: &'a TypeRegistry,
    handle: ObjectHandle,
    class: Arc<ClassMetadata>,
    id: Option<ObjectId>,
    version: Option<Version>,
    next_version: Option<Version>,
    txn: Option<TransactionId>,
    unresolved: Unresolved,
    label: String,
    nulled: RefCell<FieldBitSet>,
    outcome: ProviderOutcome,
}

impl<'a> StoreProvider<'a> {
    pub fn new(
        arena: &'a ObjectArena,
        types: &'a TypeRegistry,
        handle: ObjectHandle,
        txn: Option<TransactionId>,
    ) -> Result<Self> {
        let sm = &arena.get(handle)?.sm;
        Ok(Self {
            arena,
            types,
            handle,
            class: sm.class.clone(),
            id: sm.id.clone(),
            version: sm.version.clone(),
            next_version: None,
            txn,
            unresolved: Unresolved::Fail,
            label: sm.describe(),
            nulled: RefCell::new(FieldBitSet::new(sm.class.field_count())),
            outcome: ProviderOutcome::default(),
        })
    }

    pub fn with_next_version(mut self, version: Option<Version>) -> Self {
        self.next_version = version;
        self
    }

    /// Send unresolved references as null instead of failing
    pub fn deferring_unresolved(mut self, defer: bool) -> Self {
        self.unresolved = if defer {
            Unresolved::Null
        } else {
            Unresolved::Fail
        };
        self
    }

    pub fn into_outcome(self) -> ProviderOutcome {
        let mut outcome = self.outcome;
        outcome.nulled = self.nulled.into_inner();
        outcome
    }
}

impl ObjectProvider for StoreProvider<'_> {
    fn class_metadata(&self) -> &Arc<ClassMetadata> {
        &self.class
    }

    fn object_id(&self) -> Option<&ObjectId> {
        self.outcome.new_id.as_ref().or(self.id.as_ref())
    }

    fn version(&self) -> Option<&Version> {
        self.version.as_ref()
    }

    fn transaction_version(&self) -> Option<&Version> {
        self.next_version.as_ref()
    }

    fn transaction(&self) -> Option<TransactionId> {
        self.txn
    }

    fn provide_field(&self, field: usize) -> Result<FieldValue> {
        if self.class.version_field() == Some(field) {
            if let Some(next) = &self.next_version {
                return Ok(next.to_field_value());
            }
        }
        let slot = self.arena.get(self.handle)?;
        let externalizer = Externalizer {
            arena: self.arena,
            unresolved: self.unresolved,
            inline_embedded: true,
        };
        let (value, unresolved) = externalizer.value(&self.label, slot.object.provide_field(field))?;
        if unresolved {
            self.nulled.borrow_mut().set(field);
        }
        let value = value.unwrap_or(FieldValue::Null);
        match self
            .class
            .field_meta(field)
            .and_then(|f| self.types.converter_for_field(f))
        {
            Some(converter) => converter.to_datastore(value),
            None => Ok(value),
        }
    }

    fn replace_field(&mut self, field: usize, value: FieldValue) -> Result<()> {
        if field >= self.class.field_count() {
            return Err(PersistenceError::UnknownField {
                class: self.class.name.to_string(),
                field: field.to_string(),
            });
        }
        self.outcome.fetched.push((field, value));
        Ok(())
    }

    fn set_post_store_identity(&mut self, id: ObjectId) {
        self.outcome.new_id = Some(id);
    }

    fn set_version(&mut self, version: Option<Version>) {
        self.outcome.fetched_version = Some(version);
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}
