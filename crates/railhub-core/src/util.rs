//! Helpers for turning btleplug identities into stable hub ids.

use btleplug::platform::PeripheralId;

/// Address reported by platforms that hide the real one (macOS).
const HIDDEN_ADDRESS: &str = "00:00:00:00:00:00";

/// Format a peripheral ID as a plain string.
pub fn format_peripheral_id(id: &PeripheralId) -> String {
    format!("{:?}", id)
        .trim_start_matches("PeripheralId(")
        .trim_end_matches(')')
        .to_string()
}

/// Hub id for a peripheral: its address, or its platform id where the
/// address is hidden.
pub fn create_identifier(address: &str, peripheral_id: &PeripheralId) -> String {
    pick_identifier(address, || format_peripheral_id(peripheral_id))
}

fn pick_identifier(address: &str, fallback: impl FnOnce() -> String) -> String {
    if address == HIDDEN_ADDRESS {
        fallback()
    } else {
        address.to_string()
    }
}
