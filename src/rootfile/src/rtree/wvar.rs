use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::rtree::binder::{bind_fields, collect_nested, kind_of};
use crate::rtree::{FieldSpec, Reflect, Slot};
use crate::streamer::{ElementKind, StreamerInfo, Value};

/// Source yields the value of a leaf for the entry being written.
trait Source: Send + Sync {
    fn snapshot(&self) -> Value;
}

struct SlotSource<T>(Slot<T>);

impl<T: Reflect> Source for SlotSource<T> {
    fn snapshot(&self) -> Value {
        self.0.lock().to_value()
    }
}

struct FieldSource<T> {
    slot: Slot<T>,
    spec: FieldSpec<T>,
}

impl<T: Reflect> Source for FieldSource<T> {
    fn snapshot(&self) -> Value {
        (self.spec.get)(&*self.slot.lock())
    }
}

/// WriteVar binds a value to the leaf storing it.
#[derive(Clone)]
pub struct WriteVar {
    name: String,
    kind: ElementKind,
    source: Arc<dyn Source>,
    /// layouts of the records the value embeds.
    streamers: Vec<StreamerInfo>,
}

impl fmt::Debug for WriteVar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteVar")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish()
    }
}

impl WriteVar {
    /// new binds slot to a leaf named name whose type follows the slot's.
    /// Vectors become length-prefixed leaves, see `with_count`.
    pub fn new<T: Reflect>(name: impl Into<String>, slot: &Slot<T>) -> Result<Self> {
        let name = name.into();
        let desc = T::type_desc();
        let kind = kind_of(&desc)
            .map_err(|_| Error::binding(format!("invalid type for write variable {:?}: {}", name, desc.name())))?;
        let mut streamers = Vec::new();
        collect_nested(&desc, &mut streamers)?;
        Ok(Self {
            name,
            kind,
            source: Arc::new(SlotSource(slot.clone())),
            streamers,
        })
    }

    /// with_count makes a vector of basic values a counted leaf whose length
    /// is held by leaf count.
    pub fn with_count(mut self, count: impl Into<String>) -> Result<Self> {
        let elem = match &self.kind {
            ElementKind::Vector(elem) => match elem.as_ref() {
                ElementKind::Basic(t) => *t,
                _ => return Err(self.not_countable()),
            },
            ElementKind::Counted { elem, .. } => *elem,
            _ => return Err(self.not_countable()),
        };
        self.kind = ElementKind::Counted {
            elem,
            count: count.into(),
        };
        Ok(self)
    }

    fn not_countable(&self) -> Error {
        Error::binding(format!(
            "write variable {:?} of kind {} cannot be counted",
            self.name, self.kind
        ))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &ElementKind {
        &self.kind
    }

    /// count is the leaf holding the length of a counted variable.
    pub fn count(&self) -> Option<&str> {
        match &self.kind {
            ElementKind::Counted { count, .. } => Some(count),
            _ => None,
        }
    }

    pub(crate) fn streamers(&self) -> &[StreamerInfo] {
        &self.streamers
    }

    pub(crate) fn value(&self) -> Value {
        self.source.snapshot()
    }
}

/// write_vars binds every member of the record held by slot to a leaf.
pub fn write_vars<T: Reflect>(slot: &Slot<T>) -> Result<Vec<WriteVar>> {
    let specs = T::record_fields().ok_or_else(|| {
        Error::binding(format!(
            "expect a record target, got {}",
            T::type_desc().name()
        ))
    })?;
    let bindings = bind_fields::<T>()?;

    let mut vars = Vec::with_capacity(bindings.len());
    for b in bindings {
        let spec = specs[b.index].clone();
        let mut streamers = Vec::new();
        collect_nested(&spec.desc, &mut streamers)?;
        vars.push(WriteVar {
            name: b.leaf,
            kind: b.kind,
            source: Arc::new(FieldSource {
                slot: slot.clone(),
                spec,
            }),
            streamers,
        });
    }
    Ok(vars)
}

#[cfg(test)]
mod tests {
    use crate::rtree::{write_vars, Slot, WriteVar};
    use crate::streamer::{BasicType, ElementKind, Value};

    #[derive(Debug, Default)]
    struct Track {
        n: u16,
        pts: Vec<f32>,
        tag: [u8; 4],
    }

    crate::impl_record!(Track {
        n: u16,
        pts: Vec<f32> => "pts[n]",
        tag: [u8; 4],
    });

    #[test]
    fn test_write_var() {
        let slot = Slot::new(vec![1.5_f32, 2.5]);
        let v = WriteVar::new("xs", &slot).unwrap();
        assert_eq!(
            v.kind(),
            &ElementKind::Vector(Box::new(ElementKind::Basic(BasicType::F32)))
        );
        let v = v.with_count("n").unwrap();
        assert_eq!(v.count(), Some("n"));
        assert_eq!(v.value(), Value::Array(vec![Value::F32(1.5), Value::F32(2.5)]));

        let s = WriteVar::new("s", &Slot::new(String::new())).unwrap();
        assert!(s.with_count("n").is_err());
        assert!(WriteVar::new("m", &Slot::new(0_usize)).is_err());
    }

    #[test]
    fn test_write_vars() {
        let slot = Slot::new(Track {
            n: 1,
            pts: vec![4.0],
            tag: *b"abcd",
        });
        let vars = write_vars(&slot).unwrap();
        let names: Vec<&str> = vars.iter().map(|v| v.name()).collect();
        assert_eq!(names, vec!["n", "pts", "tag"]);
        assert_eq!(vars[1].count(), Some("n"));

        slot.lock().n = 2;
        assert_eq!(vars[0].value(), Value::U16(2));
        assert!(write_vars(&Slot::new(1.0_f64)).is_err());
    }
}
