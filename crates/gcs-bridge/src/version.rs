//! Protocol versions negotiated per connection.

/// Protocol capability level of a connection.
///
/// `V2` is the legacy level assumed when the host skips negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProtocolVersion {
    V2 = 2,
    V3 = 3,
    V4 = 4,
}

impl ProtocolVersion {
    pub const LEGACY: Self = Self::V2;
    pub const ALL: [Self; 3] = [Self::V2, Self::V3, Self::V4];

    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            2 => Some(Self::V2),
            3 => Some(Self::V3),
            4 => Some(Self::V4),
            _ => None,
        }
    }

    /// Requests may carry activity ids and log records are keyed by them.
    pub fn supports_tracing(self) -> bool {
        self >= Self::V4
    }

    pub fn supports_lifecycle_notifications(self) -> bool {
        self >= Self::V4
    }

    /// All versions from `LEGACY` up to and including `self`.
    pub fn up_to(self) -> impl Iterator<Item = Self> {
        Self::ALL.into_iter().filter(move |v| *v <= self)
    }
}

impl From<ProtocolVersion> for u32 {
    fn from(version: ProtocolVersion) -> Self {
        version.as_u32()
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.as_u32())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versions_are_ordered() {
        assert!(ProtocolVersion::V2 < ProtocolVersion::V3);
        assert!(ProtocolVersion::V3 < ProtocolVersion::V4);
        assert_eq!(ProtocolVersion::LEGACY, ProtocolVersion::V2);
    }

    #[test]
    fn from_u32_rejects_unknown() {
        assert_eq!(ProtocolVersion::from_u32(4), Some(ProtocolVersion::V4));
        assert_eq!(ProtocolVersion::from_u32(1), None);
        assert_eq!(ProtocolVersion::from_u32(5), None);
    }

    #[test]
    fn tracing_requires_v4() {
        assert!(!ProtocolVersion::V3.supports_tracing());
        assert!(ProtocolVersion::V4.supports_tracing());
    }

    #[test]
    fn up_to_lists_supported_range() {
        let versions: Vec<u32> = ProtocolVersion::V3.up_to().map(u32::from).collect();
        assert_eq!(versions, vec![2, 3]);
    }
}
