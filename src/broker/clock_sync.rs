use crate::error::{HermesError, Result};

/// Elects the reference broker: the lexicographically smallest id among
/// the clock-eligible brokers, or the sole broker when it has no peers.
/// Every broker runs this over the same descriptor set; a split
/// configuration is caught later by the SYNC_OK acknowledgement carrying
/// the elected id.
pub fn elect_reference(
    self_id: &str,
    self_eligible: bool,
    peers: &[(String, bool)],
) -> Result<String> {
    let mut candidates: Vec<&str> = peers
        .iter()
        .filter(|(_, eligible)| *eligible)
        .map(|(id, _)| id.as_str())
        .collect();
    if self_eligible {
        candidates.push(self_id);
    }

    match candidates.iter().min() {
        Some(id) => Ok(id.to_string()),
        None if peers.is_empty() => Ok(self_id.to_string()),
        None => Err(HermesError::Sync(
            "no clock-eligible broker in the topology".into(),
        )),
    }
}
