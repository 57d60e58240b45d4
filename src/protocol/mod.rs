//! Register map and value codec for the two instruments.
//!
//! Both instruments speak a register read/write protocol over the serial
//! link (see [`rtu`] for the wire framing). Multi-register values use
//! big-endian register order: high word first.

pub mod rtu;

/// Relay on/off register. Written 1 to energize, 0 to release.
pub const RELAY_REG_POWER: u16 = 512;

/// Regulator setpoint, high word.
pub const GFR_REG_SETPOINT_HIGH: u16 = 2053;
/// Regulator setpoint, low word.
pub const GFR_REG_SETPOINT_LOW: u16 = 2054;
/// Regulator gas selection register.
pub const GFR_REG_GAS: u16 = 2100;
/// Regulator measured flow, high word.
pub const GFR_REG_FLOW_HIGH: u16 = 2103;
/// Regulator measured flow, low word.
pub const GFR_REG_FLOW_LOW: u16 = 2104;

/// Fixed-point scale shared by the setpoint and flow registers: the
/// instrument carries flow values as thousandths of an sccm.
pub const FIXED_POINT_SCALE: f64 = 1000.0;

/// Encodes a flow value into the 32-bit fixed-point register pair,
/// high word first.
pub fn encode_fixed(value: f64) -> (u16, u16) {
    let raw = (value * FIXED_POINT_SCALE).round() as u32;
    ((raw >> 16) as u16, raw as u16)
}

/// Reassembles a flow value from the 32-bit fixed-point register pair.
pub fn decode_fixed(high: u16, low: u16) -> f64 {
    let raw = (u32::from(high) << 16) | u32::from(low);
    f64::from(raw) / FIXED_POINT_SCALE
}

/// The numeric target actually committed for a requested setpoint, after
/// fixed-point quantization.
pub fn quantize_setpoint(value: f64) -> f64 {
    (value * FIXED_POINT_SCALE).round() / FIXED_POINT_SCALE
}
