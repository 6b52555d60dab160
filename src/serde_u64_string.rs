//! Deserialize an unsigned id from a JSON number or a numeric string (JS clients send either).
//! Null, missing, and unparsable values decode as 0, which callers treat as "not provided".

use serde::{Deserialize, Deserializer};

pub fn deserialize<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Lenient {
        Num(u64),
        Str(String),
        Other(serde_json::Value),
    }
    let v = Option::<Lenient>::deserialize(deserializer)?;
    Ok(match v {
        Some(Lenient::Num(n)) => n,
        Some(Lenient::Str(s)) => s.trim().parse().unwrap_or(0),
        Some(Lenient::Other(_)) | None => 0,
    })
}
