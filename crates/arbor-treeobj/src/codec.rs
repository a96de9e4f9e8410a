//! Canonical JSON form of tree-objects.
//!
//! The canonical bytes of an object are what gets hashed into its blobref,
//! so the encoding must be injective up to structural equality: serde_json
//! maps keep keys sorted and `Dir` entries are already a sorted map, so two
//! structurally equal objects always serialize identically.
//!
//! Wire shape: `{"data": <variant data>, "type": "<name>", "ver": 1}` with
//! `val` data base64-encoded, ref variants carrying blobref arrays, `dir`
//! nesting encoded objects, and `symlink` carrying `{namespace?, target}`.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::{json, Map, Value};

use arbor_types::KvsError;

use crate::{Blobref, TreeObj};

/// Format version stamped into every encoded object.
const TREEOBJ_VERSION: u64 = 1;

fn to_value(obj: &TreeObj) -> Value {
    let data = match obj {
        TreeObj::Val(bytes) => Value::String(BASE64.encode(bytes)),
        TreeObj::ValRef(refs) | TreeObj::DirRef(refs) => Value::Array(
            refs.iter().map(|r| Value::String(r.as_str().to_string())).collect(),
        ),
        TreeObj::Dir(entries) => {
            let mut map = Map::new();
            for (name, child) in entries {
                map.insert(name.clone(), to_value(child));
            }
            Value::Object(map)
        }
        TreeObj::Symlink { namespace, target } => {
            let mut map = Map::new();
            if let Some(ns) = namespace {
                map.insert("namespace".to_string(), Value::String(ns.clone()));
            }
            map.insert("target".to_string(), Value::String(target.clone()));
            Value::Object(map)
        }
    };
    json!({
        "data": data,
        "type": obj.type_name(),
        "ver": TREEOBJ_VERSION,
    })
}

fn refs_from(data: &Value) -> Result<Vec<Blobref>, KvsError> {
    let arr = data.as_array().ok_or(KvsError::Proto)?;
    arr.iter()
        .map(|v| {
            let s = v.as_str().ok_or(KvsError::Proto)?;
            Blobref::parse(s)
        })
        .collect()
}

fn from_value(value: &Value) -> Result<TreeObj, KvsError> {
    let obj = value.as_object().ok_or(KvsError::Proto)?;
    let ver = obj.get("ver").and_then(Value::as_u64).ok_or(KvsError::Proto)?;
    if ver != TREEOBJ_VERSION {
        return Err(KvsError::Proto);
    }
    let typ = obj.get("type").and_then(Value::as_str).ok_or(KvsError::Proto)?;
    let data = obj.get("data").ok_or(KvsError::Proto)?;
    match typ {
        "val" => {
            let s = data.as_str().ok_or(KvsError::Proto)?;
            let bytes = BASE64.decode(s).map_err(|_| KvsError::Proto)?;
            Ok(TreeObj::Val(bytes))
        }
        "valref" => Ok(TreeObj::ValRef(refs_from(data)?)),
        "dirref" => Ok(TreeObj::DirRef(refs_from(data)?)),
        "dir" => {
            let entries = data.as_object().ok_or(KvsError::Proto)?;
            let mut dir = std::collections::BTreeMap::new();
            for (name, child) in entries {
                dir.insert(name.clone(), from_value(child)?);
            }
            Ok(TreeObj::Dir(dir))
        }
        "symlink" => {
            let link = data.as_object().ok_or(KvsError::Proto)?;
            let target = link
                .get("target")
                .and_then(Value::as_str)
                .ok_or(KvsError::Proto)?
                .to_string();
            let namespace = match link.get("namespace") {
                Some(v) => Some(v.as_str().ok_or(KvsError::Proto)?.to_string()),
                None => None,
            };
            Ok(TreeObj::Symlink { namespace, target })
        }
        _ => Err(KvsError::Proto),
    }
}

pub(crate) fn encode(obj: &TreeObj) -> Vec<u8> {
    // serde_json cannot fail on these value shapes
    serde_json::to_vec(&to_value(obj)).expect("treeobj value is always serializable")
}

pub(crate) fn decode(data: &[u8]) -> Result<TreeObj, KvsError> {
    let value: Value = serde_json::from_slice(data).map_err(|_| KvsError::Proto)?;
    from_value(&value)
}

impl serde::Serialize for TreeObj {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        to_value(self).serialize(serializer)
    }
}

impl<'de> serde::Deserialize<'de> for TreeObj {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        from_value(&value).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HashAlgo;

    #[test]
    fn canonical_key_order() {
        let s = String::from_utf8(TreeObj::val(*b"x").encode()).unwrap();
        // serde_json maps sort keys: data < type < ver
        let d = s.find("\"data\"").unwrap();
        let t = s.find("\"type\"").unwrap();
        let v = s.find("\"ver\"").unwrap();
        assert!(d < t && t < v);
    }

    #[test]
    fn val_data_is_base64() {
        let s = String::from_utf8(TreeObj::val(*b"abcd").encode()).unwrap();
        assert!(s.contains("YWJjZA=="), "encoded form: {s}");
    }

    #[test]
    fn symlink_namespace_field_optional() {
        let plain = TreeObj::symlink(None, "a.b");
        let cross = TreeObj::symlink(Some("other"), "a.b");
        let plain_s = String::from_utf8(plain.encode()).unwrap();
        let cross_s = String::from_utf8(cross.encode()).unwrap();
        assert!(!plain_s.contains("namespace"));
        assert!(cross_s.contains("\"namespace\":\"other\""));
    }

    #[test]
    fn decode_checks_ref_strings() {
        let bogus = format!(
            "{{\"data\":[\"oops\"],\"type\":\"dirref\",\"ver\":1}}"
        );
        assert!(decode(bogus.as_bytes()).is_err());
        let good = format!(
            "{{\"data\":[\"{}\"],\"type\":\"dirref\",\"ver\":1}}",
            HashAlgo::Sha1.hash(b"d").as_str()
        );
        assert!(decode(good.as_bytes()).is_ok());
    }
}
