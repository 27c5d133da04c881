use serde_json::Value;

use super::CollectionError;

pub(super) fn parse(bytes: &[u8]) -> Result<Value, CollectionError> {
    serde_json::from_slice(bytes).map_err(CollectionError::unparseable)
}

pub(super) fn render(value: &Value) -> std::io::Result<Vec<u8>> {
    let mut out = serde_json::to_vec_pretty(value)?;
    out.push(b'\n');
    Ok(out)
}
