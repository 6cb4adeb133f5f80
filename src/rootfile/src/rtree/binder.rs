use regex::Regex;

use crate::error::{Error, Result};
use crate::rtree::reflect::{FieldSpec, Reflect, TypeDesc, RECORD_VERSION};
use crate::streamer::{ElementKind, FieldDesc, StreamerInfo};

lazy_static! {
    static ref TAG: Regex = Regex::new(r"^([A-Za-z_][A-Za-z0-9_.]*)?((?:\[[^\[\]]*\])*)$").unwrap();
    static ref DIM: Regex = Regex::new(r"\[([^\[\]]*)\]").unwrap();
}

/// Shape is the parsed shape annotation of a member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Shape {
    Scalar,
    FixedArray(Vec<usize>),
    CountedSequence(String),
}

/// Dim is one bracketed dimension of an annotation.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Dim {
    Fixed(usize),
    Count(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Annotation {
    name: Option<String>,
    dims: Vec<Dim>,
}

/// parse_annotation parses `name`, `name[3][4]` or `name[count]`. `Ok(None)`
/// marks a skipped member.
fn parse_annotation(member: &str, tag: &str) -> Result<Option<Annotation>> {
    let tag = tag.trim();
    if tag == "-" {
        return Ok(None);
    }
    let caps = TAG
        .captures(tag)
        .ok_or_else(|| Error::binding(format!("invalid struct-tag {:?} for field {:?}", tag, member)))?;

    let name = caps.get(1).map(|m| m.as_str().to_string());
    let mut dims = Vec::new();
    if let Some(m) = caps.get(2) {
        for dim in DIM.captures_iter(m.as_str()) {
            let d = dim[1].trim();
            if d.is_empty() {
                return Err(Error::binding(format!(
                    "invalid struct-tag {:?} for field {:?}: empty dimension",
                    tag, member
                )));
            }
            match d.parse::<usize>() {
                Ok(n) => dims.push(Dim::Fixed(n)),
                Err(_) => dims.push(Dim::Count(d.to_string())),
            }
        }
    }
    Ok(Some(Annotation { name, dims }))
}

/// parse_shape parses the shape part of an annotation.
pub fn parse_shape(tag: &str) -> Result<Shape> {
    let ann = match parse_annotation("", tag)? {
        Some(ann) => ann,
        None => return Ok(Shape::Scalar),
    };
    match ann.dims.as_slice() {
        [] => Ok(Shape::Scalar),
        [Dim::Count(c)] => Ok(Shape::CountedSequence(c.clone())),
        dims => {
            let mut fixed = Vec::with_capacity(dims.len());
            for d in dims {
                match d {
                    Dim::Fixed(n) => fixed.push(*n),
                    Dim::Count(_) => {
                        return Err(Error::binding(format!(
                            "invalid struct-tag {:?}: a count must be the only dimension",
                            tag
                        )))
                    }
                }
            }
            Ok(Shape::FixedArray(fixed))
        }
    }
}

/// leaf_name is the leaf a member binds to, None for skipped members.
pub(crate) fn leaf_name<T>(spec: &FieldSpec<T>) -> Option<String> {
    match spec.tag {
        Some(tag) => match parse_annotation(spec.member, tag) {
            Ok(Some(Annotation { name: Some(name), .. })) => Some(name),
            Ok(None) => None,
            _ => Some(spec.member.to_string()),
        },
        None => Some(spec.member.to_string()),
    }
}

/// FieldBinding maps one member of a record type to a leaf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldBinding {
    /// position of the member in the record's field list.
    pub index: usize,
    pub member: &'static str,
    pub leaf: String,
    pub kind: ElementKind,
}

/// counts_for reports whether member `count` follows a naming convention
/// making it the length of member `seq`: `nseq`, `n_seq` or `seq_n`, ignoring case.
fn counts_for(count: &str, seq: &str) -> bool {
    let count = count.to_lowercase();
    let seq = seq.to_lowercase();
    count == format!("n{}", seq) || count == format!("n_{}", seq) || count == format!("{}_n", seq)
}

/// kind_of maps a bindable type to the leaf kind storing it, vectors being
/// length-prefixed.
pub fn kind_of(desc: &TypeDesc) -> Result<ElementKind> {
    let kind = match desc {
        TypeDesc::Basic(t) => ElementKind::Basic(*t),
        TypeDesc::Str => ElementKind::String,
        TypeDesc::Array { .. } => match desc.flatten() {
            Some((TypeDesc::Basic(t), dims)) if ElementKind::array_len(&dims).is_some() => {
                ElementKind::FixedArray { elem: *t, dims }
            }
            _ => return Err(Error::binding(format!("unsupported array type {}", desc.name()))),
        },
        TypeDesc::Seq(elem) => ElementKind::Vector(Box::new(kind_of(elem)?)),
        TypeDesc::Record { class, .. } => ElementKind::Record { class: class.clone() },
        TypeDesc::Dynamic | TypeDesc::Unsupported(_) => {
            return Err(Error::binding(format!("unsupported type {}", desc.name())))
        }
    };
    Ok(kind)
}

/// bind_fields derives the leaf bindings of a record type from its members,
/// in declaration order.
pub fn bind_fields<T: Reflect>() -> Result<Vec<FieldBinding>> {
    let specs = match T::record_fields() {
        Some(specs) => specs,
        None => {
            return Err(Error::binding(format!(
                "expect a record target, got {}",
                T::type_desc().name()
            )))
        }
    };

    let mut bindings = Vec::with_capacity(specs.len());
    for (i, spec) in specs.iter().enumerate() {
        let ann = match spec.tag {
            Some(tag) => match parse_annotation(spec.member, tag)? {
                Some(ann) => ann,
                None => continue,
            },
            None => Annotation {
                name: None,
                dims: Vec::new(),
            },
        };
        let leaf = ann.name.clone().unwrap_or_else(|| spec.member.to_string());
        let tag = spec.tag.unwrap_or_default();
        let kind = bind_member(&specs, i, &leaf, tag, &ann.dims)?;
        bindings.push(FieldBinding {
            index: i,
            member: spec.member,
            leaf,
            kind,
        });
    }
    Ok(bindings)
}

fn bind_member<T>(specs: &[FieldSpec<T>], i: usize, leaf: &str, tag: &str, dims: &[Dim]) -> Result<ElementKind> {
    let spec = &specs[i];
    let member = spec.member;
    let invalid_type = || {
        Error::binding(format!(
            "invalid field type for {:?}: {}",
            member,
            spec.desc.name()
        ))
    };

    match &spec.desc {
        TypeDesc::Dynamic | TypeDesc::Unsupported(_) => Err(invalid_type()),
        TypeDesc::Basic(_) | TypeDesc::Str | TypeDesc::Record { .. } => {
            if !dims.is_empty() {
                return Err(Error::binding(format!(
                    "invalid field type for {:?}, or invalid struct-tag {:?}: {}",
                    leaf,
                    tag,
                    spec.desc.name()
                )));
            }
            kind_of(&spec.desc)
        }
        TypeDesc::Array { .. } => {
            let (elem, shape) = spec.desc.flatten().ok_or_else(invalid_type)?;
            let elem = match elem {
                TypeDesc::Basic(t) => *t,
                _ => return Err(invalid_type()),
            };
            if !dims.is_empty() {
                if dims.len() != shape.len() {
                    return Err(Error::binding(format!(
                        "invalid number of array-dimension for field {:?}: {:?}",
                        member, tag
                    )));
                }
                let same = dims
                    .iter()
                    .zip(&shape)
                    .all(|(d, n)| matches!(d, Dim::Fixed(m) if m == n));
                if !same {
                    return Err(Error::binding(format!(
                        "invalid array-dimension for field {:?}: {:?} does not match {}",
                        member,
                        tag,
                        spec.desc.name()
                    )));
                }
            }
            if ElementKind::array_len(&shape).is_none() {
                return Err(Error::binding(format!(
                    "invalid array-dimension for field {:?}: {} is too large",
                    member,
                    spec.desc.name()
                )));
            }
            Ok(ElementKind::FixedArray { elem, dims: shape })
        }
        TypeDesc::Seq(elem) => {
            if dims.len() > 1 {
                return Err(Error::binding(format!(
                    "invalid number of slice-dimensions for field {:?}: {:?}",
                    member, tag
                )));
            }
            let basic = match elem.as_ref() {
                TypeDesc::Basic(t) => Some(*t),
                _ => None,
            };
            match (dims.first(), basic) {
                (Some(Dim::Count(count)), Some(elem)) => {
                    let found = specs.iter().enumerate().any(|(j, s)| {
                        j != i && s.desc.is_integer() && leaf_name(s).as_deref() == Some(count.as_str())
                    });
                    if !found {
                        return Err(Error::binding(format!(
                            "invalid count {:?} for field {:?}: no integer member binds to it",
                            count, member
                        )));
                    }
                    Ok(ElementKind::Counted {
                        elem,
                        count: count.clone(),
                    })
                }
                (Some(_), _) => Err(Error::binding(format!(
                    "invalid slice-dimension for field {:?}: {:?}",
                    member, tag
                ))),
                (None, Some(elem)) => {
                    let mut counts = Vec::new();
                    for j in [i.checked_sub(1), Some(i + 1)].into_iter().flatten() {
                        if let Some(s) = specs.get(j) {
                            if s.desc.is_integer() && counts_for(s.member, member) {
                                if let Some(name) = leaf_name(s) {
                                    counts.push(name);
                                }
                            }
                        }
                    }
                    match counts.as_slice() {
                        [] => Ok(ElementKind::Vector(Box::new(ElementKind::Basic(elem)))),
                        [count] => Ok(ElementKind::Counted {
                            elem,
                            count: count.clone(),
                        }),
                        _ => Err(Error::binding(format!(
                            "ambiguous count for field {:?}: both {:?} and {:?} may count it",
                            member, counts[0], counts[1]
                        ))),
                    }
                }
                (None, None) => kind_of(&spec.desc),
            }
        }
    }
}

/// record_streamers derives the layout of a record type, followed by the
/// layouts of the records it embeds.
pub fn record_streamers<T: Reflect>() -> Result<Vec<StreamerInfo>> {
    let class = match T::type_desc() {
        TypeDesc::Record { class, .. } => class,
        other => {
            return Err(Error::binding(format!(
                "expect a record target, got {}",
                other.name()
            )))
        }
    };
    let specs = T::record_fields().unwrap_or_default();
    let bindings = bind_fields::<T>()?;

    let mut fields: Vec<FieldDesc> = Vec::with_capacity(bindings.len());
    let mut nested = Vec::new();
    for b in bindings {
        if let ElementKind::Counted { count, .. } = &b.kind {
            if !fields.iter().any(|f| &f.name == count) {
                return Err(Error::binding(format!(
                    "count {:?} of field {:?} must be declared before it",
                    count, b.member
                )));
            }
        }
        collect_nested(&specs[b.index].desc, &mut nested)?;
        fields.push(FieldDesc::new(b.leaf, b.kind));
    }

    let mut infos = vec![StreamerInfo::new(class, RECORD_VERSION, fields)];
    infos.extend(nested);
    Ok(infos)
}

/// collect_nested appends the layouts of the record types reachable from desc.
pub(crate) fn collect_nested(desc: &TypeDesc, out: &mut Vec<StreamerInfo>) -> Result<()> {
    match desc {
        TypeDesc::Record { streamers, .. } => {
            for info in streamers()? {
                if !out.iter().any(|i| i.class == info.class) {
                    out.push(info);
                }
            }
            Ok(())
        }
        TypeDesc::Seq(elem) | TypeDesc::Array { elem, .. } => collect_nested(elem, out),
        _ => Ok(()),
    }
}

/// compatible reports whether a value of type desc can hold entries of kind.
pub fn compatible(desc: &TypeDesc, kind: &ElementKind) -> bool {
    match (desc, kind) {
        (TypeDesc::Dynamic, _) => true,
        (TypeDesc::Basic(a), ElementKind::Basic(b)) => a == b,
        (TypeDesc::Str, ElementKind::String) => true,
        (TypeDesc::Array { .. }, ElementKind::FixedArray { elem, dims }) => match desc.flatten() {
            Some((TypeDesc::Basic(t), shape)) => {
                t == elem
                    && matches!(
                        (ElementKind::array_len(&shape), ElementKind::array_len(dims)),
                        (Some(a), Some(b)) if a == b
                    )
            }
            _ => false,
        },
        (TypeDesc::Seq(elem), ElementKind::Counted { elem: t, .. }) => {
            matches!(elem.as_ref(), TypeDesc::Basic(b) if b == t)
        }
        (TypeDesc::Seq(elem), ElementKind::Vector(kind)) => compatible(elem, kind),
        (TypeDesc::Record { class, .. }, ElementKind::Record { class: c }) => class == c,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use crate::error::Error;
    use crate::rtree::binder::{bind_fields, compatible, parse_shape, record_streamers, Shape};
    use crate::rtree::{Reflect, TypeDesc};
    use crate::streamer::{BasicType, ElementKind};

    fn binding_error<T>(res: crate::Result<T>) -> String {
        match res {
            Err(Error::Binding(msg)) => msg,
            Err(e) => panic!("unexpected error {}", e),
            Ok(_) => panic!("expected a binding error"),
        }
    }

    #[test]
    fn test_parse_shape() {
        assert_eq!(parse_shape("x").unwrap(), Shape::Scalar);
        assert_eq!(parse_shape("arr12[10][10]").unwrap(), Shape::FixedArray(vec![10, 10]));
        assert_eq!(
            parse_shape("F32s[N]").unwrap(),
            Shape::CountedSequence("N".to_string())
        );
        assert_eq!(parse_shape("[3]").unwrap(), Shape::FixedArray(vec![3]));
        assert!(parse_shape("x[N][2]").is_err());
        assert!(parse_shape("x[").is_err());
        assert!(parse_shape("x[]").is_err());
    }

    #[derive(Default)]
    struct Event {
        n: i32,
        f32s: Vec<f32>,
        arr: [[f64; 10]; 10],
        name: String,
        skipped: u8,
        hits: Vec<i16>,
        n_hits: u32,
        extra: Vec<f32>,
    }

    crate::impl_record!(Event {
        n: i32 => "N",
        f32s: Vec<f32> => "F32s[N]",
        arr: [[f64; 10]; 10] => "arr12[10][10]",
        name: String,
        skipped: u8 => "-",
        hits: Vec<i16>,
        n_hits: u32,
        extra: Vec<f32>,
    });

    #[test]
    fn test_bind_fields() {
        let bindings = bind_fields::<Event>().unwrap();
        let got: Vec<(&str, ElementKind)> = bindings.iter().map(|b| (b.leaf.as_str(), b.kind.clone())).collect();
        assert_eq!(
            got,
            vec![
                ("N", ElementKind::Basic(BasicType::I32)),
                (
                    "F32s",
                    ElementKind::Counted {
                        elem: BasicType::F32,
                        count: "N".to_string()
                    }
                ),
                (
                    "arr12",
                    ElementKind::FixedArray {
                        elem: BasicType::F64,
                        dims: vec![10, 10]
                    }
                ),
                ("name", ElementKind::String),
                (
                    "hits",
                    ElementKind::Counted {
                        elem: BasicType::I16,
                        count: "n_hits".to_string()
                    }
                ),
                ("n_hits", ElementKind::Basic(BasicType::U32)),
                (
                    "extra",
                    ElementKind::Vector(Box::new(ElementKind::Basic(BasicType::F32)))
                ),
            ]
        );
        assert_eq!(bindings[4].index, 5);
    }

    #[derive(Default)]
    struct WithIsize {
        i32_: isize,
    }
    crate::impl_record!(WithIsize { i32_: isize => "I32" });

    #[derive(Default)]
    struct WithMap {
        m: HashMap<String, i32>,
    }
    crate::impl_record!(WithMap { m: HashMap<String, i32> => "Map" });

    #[derive(Default)]
    struct ScalarWithDims {
        n: i32,
    }
    crate::impl_record!(ScalarWithDims { n: i32 => "N[42]" });

    #[derive(Default)]
    struct SliceDims {
        n: i32,
        sli: Vec<f32>,
    }
    crate::impl_record!(SliceDims { n: i32 => "N", sli: Vec<f32> => "vs[N][N]" });

    #[derive(Default)]
    struct ArrayDims {
        arr: [[[f32; 2]; 2]; 2],
    }
    crate::impl_record!(ArrayDims { arr: [[[f32; 2]; 2]; 2] => "vs[1][2][3][4]" });

    #[derive(Default)]
    struct WrongDims {
        arr: [f32; 4],
    }
    crate::impl_record!(WrongDims { arr: [f32; 4] => "arr[5]" });

    #[derive(Default)]
    struct Ambiguous {
        nxs: i32,
        xs: Vec<f32>,
        xs_n: i32,
    }
    crate::impl_record!(Ambiguous { nxs: i32, xs: Vec<f32>, xs_n: i32 });

    #[derive(Default)]
    struct MissingCount {
        xs: Vec<f32>,
    }
    crate::impl_record!(MissingCount { xs: Vec<f32> => "xs[n]" });

    #[test]
    fn test_bind_errors() {
        assert_eq!(
            binding_error(bind_fields::<WithIsize>()),
            r#"invalid field type for "i32_": isize"#
        );
        assert_eq!(
            binding_error(bind_fields::<WithMap>()),
            r#"invalid field type for "m": HashMap<String, i32>"#
        );
        assert_eq!(
            binding_error(bind_fields::<ScalarWithDims>()),
            r#"invalid field type for "N", or invalid struct-tag "N[42]": i32"#
        );
        assert_eq!(
            binding_error(bind_fields::<SliceDims>()),
            r#"invalid number of slice-dimensions for field "sli": "vs[N][N]""#
        );
        assert_eq!(
            binding_error(bind_fields::<ArrayDims>()),
            r#"invalid number of array-dimension for field "arr": "vs[1][2][3][4]""#
        );
        assert!(binding_error(bind_fields::<WrongDims>()).starts_with("invalid array-dimension"));
        assert!(binding_error(bind_fields::<Ambiguous>()).starts_with("ambiguous count"));
        assert!(binding_error(bind_fields::<MissingCount>()).contains("no integer member"));
        assert_eq!(
            binding_error(bind_fields::<i32>()),
            "expect a record target, got i32"
        );
    }

    #[derive(Default)]
    struct Inner {
        px: f64,
    }
    crate::impl_record!(Inner { px: f64 });

    #[derive(Default)]
    struct Outer {
        n: i32,
        xs: Vec<f32>,
        inner: Inner,
        inners: Vec<Inner>,
    }
    crate::impl_record!(Outer {
        n: i32,
        xs: Vec<f32> => "xs[n]",
        inner: Inner,
        inners: Vec<Inner>,
    });

    #[test]
    fn test_record_streamers() {
        let infos = record_streamers::<Outer>().unwrap();
        let classes: Vec<&str> = infos.iter().map(|i| i.class.as_str()).collect();
        assert_eq!(classes, vec!["Outer", "Inner"]);
        assert_eq!(
            infos[0].field("inners").unwrap().kind,
            ElementKind::Vector(Box::new(ElementKind::Record {
                class: "Inner".to_string()
            }))
        );
    }

    #[test]
    fn test_compatible() {
        assert!(compatible(&i32::type_desc(), &ElementKind::Basic(BasicType::I32)));
        assert!(!compatible(&f32::type_desc(), &ElementKind::Basic(BasicType::F64)));
        assert!(compatible(
            &<[f32; 6]>::type_desc(),
            &ElementKind::FixedArray {
                elem: BasicType::F32,
                dims: vec![2, 3]
            }
        ));
        assert!(compatible(
            &Vec::<f32>::type_desc(),
            &ElementKind::Counted {
                elem: BasicType::F32,
                count: "n".to_string()
            }
        ));
        assert!(compatible(&TypeDesc::Dynamic, &ElementKind::String));
        assert!(!compatible(&String::type_desc(), &ElementKind::Basic(BasicType::I8)));
    }
}
