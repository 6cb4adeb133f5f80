use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::rtree::binder::bind_fields;
use crate::rtree::{FieldSpec, Reflect, Slot, Tree, TypeDesc};
use crate::streamer::Value;

/// Sink receives the decoded value of a leaf.
trait Sink: Send + Sync {
    fn type_desc(&self) -> TypeDesc;

    fn store(&self, v: Value) -> Result<()>;

    fn snapshot(&self) -> Value;
}

struct SlotSink<T>(Slot<T>);

impl<T: Reflect> Sink for SlotSink<T> {
    fn type_desc(&self) -> TypeDesc {
        T::type_desc()
    }

    fn store(&self, v: Value) -> Result<()> {
        self.0.lock().set_value(v)
    }

    fn snapshot(&self) -> Value {
        self.0.lock().to_value()
    }
}

/// FieldSink stores into one member of a shared record.
struct FieldSink<T> {
    slot: Slot<T>,
    spec: FieldSpec<T>,
}

impl<T: Reflect> Sink for FieldSink<T> {
    fn type_desc(&self) -> TypeDesc {
        self.spec.desc.clone()
    }

    fn store(&self, v: Value) -> Result<()> {
        (self.spec.set)(&mut *self.slot.lock(), v)
    }

    fn snapshot(&self) -> Value {
        (self.spec.get)(&*self.slot.lock())
    }
}

/// ReadVar binds a leaf to the value receiving its entries.
#[derive(Clone)]
pub struct ReadVar {
    name: String,
    sink: Arc<dyn Sink>,
}

impl fmt::Debug for ReadVar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadVar")
            .field("name", &self.name)
            .field("type", &self.sink.type_desc().name())
            .finish()
    }
}

impl ReadVar {
    /// new binds leaf name to slot.
    pub fn new<T: Reflect>(name: impl Into<String>, slot: &Slot<T>) -> Self {
        Self {
            name: name.into(),
            sink: Arc::new(SlotSink(slot.clone())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn type_desc(&self) -> TypeDesc {
        self.sink.type_desc()
    }

    /// value is the last value stored by a reader.
    pub fn value(&self) -> Value {
        self.sink.snapshot()
    }

    pub(crate) fn store(&self, v: Value) -> Result<()> {
        self.sink.store(v)
    }
}

/// read_vars binds every member of the record held by slot to its leaf.
pub fn read_vars<T: Reflect>(slot: &Slot<T>) -> Result<Vec<ReadVar>> {
    let specs = T::record_fields().ok_or_else(|| {
        Error::binding(format!(
            "expect a record target, got {}",
            T::type_desc().name()
        ))
    })?;
    let bindings = bind_fields::<T>()?;
    Ok(bindings
        .into_iter()
        .map(|b| ReadVar {
            name: b.leaf,
            sink: Arc::new(FieldSink {
                slot: slot.clone(),
                spec: specs[b.index].clone(),
            }),
        })
        .collect())
}

/// read_vars_for binds every leaf of tree to a dynamically typed value.
pub fn read_vars_for(tree: &Tree) -> Vec<ReadVar> {
    tree.leaves()
        .into_iter()
        .map(|leaf| ReadVar::new(leaf.name.clone(), &Slot::new(leaf.kind.zero())))
        .collect()
}

#[cfg(test)]
mod tests {
    use crate::rtree::{read_vars, ReadVar, Slot};
    use crate::streamer::Value;

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Data {
        n: i32,
        xs: Vec<f64>,
        name: String,
    }

    crate::impl_record!(Data {
        n: i32 => "N",
        xs: Vec<f64> => "Xs[N]",
        name: String,
    });

    #[test]
    fn test_read_vars() {
        let slot = Slot::new(Data::default());
        let vars = read_vars(&slot).unwrap();
        let names: Vec<&str> = vars.iter().map(|v| v.name()).collect();
        assert_eq!(names, vec!["N", "Xs", "name"]);

        vars[0].store(Value::I32(2)).unwrap();
        vars[1]
            .store(Value::Array(vec![Value::F64(1.0), Value::F64(2.0)]))
            .unwrap();
        vars[2].store(Value::Str("x".into())).unwrap();
        assert_eq!(
            slot.get(),
            Data {
                n: 2,
                xs: vec![1.0, 2.0],
                name: "x".to_string()
            }
        );
        assert_eq!(vars[0].value(), Value::I32(2));
        assert!(vars[0].store(Value::F32(1.0)).is_err());
    }

    #[test]
    fn test_read_vars_rejects_scalars() {
        let slot = Slot::new(0_i32);
        let err = read_vars(&slot).unwrap_err();
        assert_eq!(err.to_string(), "expect a record target, got i32");

        let v = ReadVar::new("x", &slot);
        v.store(Value::I32(7)).unwrap();
        assert_eq!(slot.get(), 7);
    }
}
