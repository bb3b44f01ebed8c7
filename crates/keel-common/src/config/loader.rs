use serde::Deserialize;

/// Deserialize a numeric configuration value where zero means "not set".
///
/// Note that configuration of the [`Option`] type can not be parsed
/// by default, so fields using this helper represent [`None`] as zero
/// in the configuration file and in environment variables.
pub fn deserialize_non_zero<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: num_traits::Zero + serde::Deserialize<'de>,
{
    let value = T::deserialize(deserializer)?;
    if value.is_zero() {
        Ok(None)
    } else {
        Ok(Some(value))
    }
}

/// Deserialize a string configuration value where the empty string means "not set".
pub fn deserialize_non_empty_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = String::deserialize(deserializer)?;
    if value.is_empty() {
        Ok(None)
    } else {
        Ok(Some(value))
    }
}
