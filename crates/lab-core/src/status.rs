//! Status register decoding.
//!
//! Many instruments expose a byte or word whose bits each mean something
//! (`LIAS?` on a lock-in, `RDGST?` on a temperature controller). A
//! [`StatusRegister`] names the bits once so drivers can turn a raw value
//! into a list of human-readable flags, and into an error when any of the
//! flags is fatal.

use crate::error::{LabError, Result};

/// Table of `(bit, label)` pairs for one register.
#[derive(Debug, Clone, Copy)]
pub struct StatusRegister {
    pub name: &'static str,
    pub bits: &'static [(u8, &'static str)],
}

impl StatusRegister {
    pub const fn new(name: &'static str, bits: &'static [(u8, &'static str)]) -> Self {
        Self { name, bits }
    }

    /// Labels of the set bits, lowest bit first.
    pub fn decode(&self, value: u32) -> Vec<&'static str> {
        self.bits
            .iter()
            .filter(|(bit, _)| value & (1 << bit) != 0)
            .map(|(_, label)| *label)
            .collect()
    }

    /// Decode a textual register value: decimal, `0x1F`, `#H1F` or bare hex
    /// (`1F`).
    pub fn decode_str(&self, text: &str) -> Result<Vec<&'static str>> {
        Ok(self.decode(parse_register(text)?))
    }

    /// Fail with [`LabError::Status`] if any bit in `fatal_mask` is set.
    pub fn check(&self, device: &str, value: u32, fatal_mask: u32) -> Result<()> {
        let fatal = value & fatal_mask;
        if fatal == 0 {
            return Ok(());
        }
        Err(LabError::Status {
            device: device.to_string(),
            flags: self.decode(fatal).into_iter().map(str::to_string).collect(),
        })
    }
}

/// Parse a register value in any of the usual encodings.
pub fn parse_register(text: &str) -> Result<u32> {
    let t = text.trim().trim_start_matches('+');
    let parsed = if let Some(hex) = t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16)
    } else if let Some(hex) = t.strip_prefix("#H").or_else(|| t.strip_prefix("#h")) {
        u32::from_str_radix(hex, 16)
    } else if t.chars().all(|c| c.is_ascii_digit()) {
        t.parse()
    } else {
        u32::from_str_radix(t, 16)
    };
    parsed.map_err(|_| LabError::parse("status", "", text, "not a register value"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOCKIN: StatusRegister = StatusRegister::new(
        "LIAS",
        &[
            (0, "input overload"),
            (1, "filter overload"),
            (2, "output overload"),
            (3, "reference unlock"),
        ],
    );

    #[test]
    fn decodes_set_bits_in_order() {
        assert_eq!(LOCKIN.decode(0b1001), vec!["input overload", "reference unlock"]);
        assert!(LOCKIN.decode(0).is_empty());
        // Undocumented bits are ignored
        assert!(LOCKIN.decode(0x100).is_empty());
    }

    #[test]
    fn decodes_textual_encodings() {
        assert_eq!(LOCKIN.decode_str("9").unwrap().len(), 2);
        assert_eq!(LOCKIN.decode_str("0x0C").unwrap(), vec!["output overload", "reference unlock"]);
        assert_eq!(LOCKIN.decode_str("#H2").unwrap(), vec!["filter overload"]);
        assert_eq!(parse_register("1F").unwrap(), 31);
        assert!(parse_register("zz").is_err());
    }

    #[test]
    fn check_only_fails_on_fatal_bits() {
        assert!(LOCKIN.check("SR830", 0b0010, 0b1000).is_ok());
        let err = LOCKIN.check("SR830", 0b1010, 0b1000).unwrap_err();
        match err {
            LabError::Status { flags, .. } => assert_eq!(flags, vec!["reference unlock"]),
            other => panic!("unexpected {other:?}"),
        }
    }
}
