//! Lenient serde adapters for fields whose server representation drifts
//! between endpoints.

pub(crate) mod timestamp {
    use chrono::{DateTime, NaiveDateTime};
    use serde::{de, Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

    pub fn serialize<S>(value: &NaiveDateTime, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&value.format(FORMAT).to_string())
    }

    /// Accepts local date-times (`2024-05-01T10:15:30.250`) and RFC 3339
    /// values with an offset, which are normalised to UTC.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<NaiveDateTime, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        if let Ok(local) = NaiveDateTime::parse_from_str(&raw, FORMAT) {
            return Ok(local);
        }
        DateTime::parse_from_rfc3339(&raw)
            .map(|zoned| zoned.naive_utc())
            .map_err(|err| de::Error::custom(format!("invalid timestamp {raw:?}: {err}")))
    }
}

pub(crate) mod string_id {
    use serde::{de, Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Text(String),
        Number(i64),
    }

    pub fn serialize<S>(value: &str, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(value)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<String, D::Error>
    where
        D: Deserializer<'de>,
    {
        match RawId::deserialize(deserializer)? {
            RawId::Text(text) if text.is_empty() => Err(de::Error::custom("empty message id")),
            RawId::Text(text) => Ok(text),
            RawId::Number(number) => Ok(number.to_string()),
        }
    }
}
