use core::str::FromStr;

use serde::{Deserialize, Serialize};

use stockledger_core::DomainError;

/// Kind of stock movement a transaction records.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationKind {
    /// Goods received into a location.
    Receipt,
    /// Goods picked out of a location.
    Pick,
    /// Goods returned into a location.
    Return,
}

impl OperationKind {
    pub const ALL: [OperationKind; 3] = [
        OperationKind::Receipt,
        OperationKind::Pick,
        OperationKind::Return,
    ];

    /// Sign applied to the requested quantity.
    pub fn sign(self) -> i64 {
        match self {
            OperationKind::Receipt | OperationKind::Return => 1,
            OperationKind::Pick => -1,
        }
    }

    /// Signed quantity delta for `quantity` units of this kind.
    pub fn delta(self, quantity: i64) -> i64 {
        self.sign() * quantity
    }

    /// Operation that compensates this one.
    ///
    /// RECEIPT and PICK invert each other; a RETURN is compensated by a PICK.
    pub fn inverse(self) -> OperationKind {
        match self {
            OperationKind::Receipt => OperationKind::Pick,
            OperationKind::Pick => OperationKind::Receipt,
            OperationKind::Return => OperationKind::Pick,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Receipt => "RECEIPT",
            OperationKind::Pick => "PICK",
            OperationKind::Return => "RETURN",
        }
    }
}

impl core::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = DomainError;

    /// Accepts canonical names and the legacy warehouse names
    /// (`RECEPCION`, `PICKING`, `DEVOLUCION`), case-insensitively.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "RECEIPT" | "RECEPCION" => Ok(OperationKind::Receipt),
            "PICK" | "PICKING" => Ok(OperationKind::Pick),
            "RETURN" | "DEVOLUCION" => Ok(OperationKind::Return),
            other => Err(DomainError::validation(format!(
                "unknown operation kind '{other}' (expected RECEIPT, PICK or RETURN)"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inverse_table() {
        assert_eq!(OperationKind::Receipt.inverse(), OperationKind::Pick);
        assert_eq!(OperationKind::Pick.inverse(), OperationKind::Receipt);
        assert_eq!(OperationKind::Return.inverse(), OperationKind::Pick);
    }

    #[test]
    fn inverse_cancels_delta() {
        for kind in OperationKind::ALL {
            assert_eq!(kind.delta(7) + kind.inverse().delta(7), 0, "{kind}");
        }
    }

    #[test]
    fn parses_legacy_names() {
        assert_eq!("recepcion".parse::<OperationKind>().unwrap(), OperationKind::Receipt);
        assert_eq!("PICKING".parse::<OperationKind>().unwrap(), OperationKind::Pick);
        assert_eq!("Devolucion".parse::<OperationKind>().unwrap(), OperationKind::Return);
        assert!("TRANSFER".parse::<OperationKind>().is_err());
    }
}
