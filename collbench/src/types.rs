use crate::error::{BenchError, Result};

/// Rank of a participant in the benchmark (0-indexed).
pub type Rank = u32;

/// Index of a host in the cluster, derived from the rank layout.
pub type NodeId = u32;

/// Number of physical remote-fabric interfaces a rank can select from.
pub const MAX_FABRIC_INTERFACES: u8 = 8;

/// Bytes per element of the integer view used by data checks and counts.
pub const ELEMENT_BYTES: usize = std::mem::size_of::<i32>();

/// Current protocol version.
pub const PROTOCOL_VERSION: u16 = 1;

/// Priority carried in the framed message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Priority {
    /// Barriers and bootstrap handshakes.
    Critical = 0,
    /// Setup exchanges.
    Realtime = 1,
}

/// The link a connection uses to reach a peer.
///
/// Co-located peers always get `LocalFastPath`; peers on other hosts get
/// `RemoteFabric(k)` where `k < MAX_FABRIC_INTERFACES` names the physical
/// interface paired with the local device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    LocalFastPath,
    RemoteFabric(u8),
}

impl Transport {
    /// Remote-fabric transport for interface `index`.
    pub fn fabric(index: usize) -> Result<Self> {
        if index >= MAX_FABRIC_INTERFACES as usize {
            return Err(BenchError::Config(format!(
                "fabric interface {index} out of range (max {})",
                MAX_FABRIC_INTERFACES - 1
            )));
        }
        Ok(Transport::RemoteFabric(index as u8))
    }

    pub fn is_local(self) -> bool {
        matches!(self, Transport::LocalFastPath)
    }

    /// Wire code: 0 for the local path, `1 + k` for fabric interface `k`.
    pub fn code(self) -> u8 {
        match self {
            Transport::LocalFastPath => 0,
            Transport::RemoteFabric(k) => 1 + k,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Transport::LocalFastPath),
            c if c <= MAX_FABRIC_INTERFACES => Some(Transport::RemoteFabric(c - 1)),
            _ => None,
        }
    }
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::LocalFastPath => f.write_str("ipc"),
            Transport::RemoteFabric(k) => write!(f, "fabric{k}"),
        }
    }
}

/// Set of transports a buffer is registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct TransportSet(u16);

impl TransportSet {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn from_bits(bits: u16) -> Self {
        Self(bits & ((1 << (MAX_FABRIC_INTERFACES as u16 + 1)) - 1))
    }

    pub fn bits(self) -> u16 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn with(self, t: Transport) -> Self {
        Self(self.0 | (1 << t.code()))
    }

    pub fn contains(self, t: Transport) -> bool {
        self.0 & (1 << t.code()) != 0
    }

    pub fn iter(self) -> impl Iterator<Item = Transport> {
        (0..=MAX_FABRIC_INTERFACES)
            .filter_map(Transport::from_code)
            .filter(move |t| self.contains(*t))
    }
}

impl From<Transport> for TransportSet {
    fn from(t: Transport) -> Self {
        TransportSet::empty().with(t)
    }
}

impl std::ops::BitOr for Transport {
    type Output = TransportSet;

    fn bitor(self, rhs: Transport) -> TransportSet {
        TransportSet::from(self).with(rhs)
    }
}

impl std::ops::BitOr<Transport> for TransportSet {
    type Output = TransportSet;

    fn bitor(self, rhs: Transport) -> TransportSet {
        self.with(rhs)
    }
}

impl std::fmt::Display for TransportSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self.iter().map(|t| t.to_string()).collect();
        write!(f, "{{{}}}", names.join("|"))
    }
}

/// How a per-rank scalar is combined across all processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReduceMode {
    /// Every rank adopts rank 0's value.
    RankZero,
    /// Sum divided by the world size.
    Mean,
    Min,
    Max,
    Sum,
}

impl ReduceMode {
    /// Map the numeric `-a/--average` flag: 0 rank0, 1 mean, 2 min, 3 max, 4 sum.
    pub fn from_flag(flag: i64) -> Result<Self> {
        match flag {
            0 => Ok(ReduceMode::RankZero),
            1 => Ok(ReduceMode::Mean),
            2 => Ok(ReduceMode::Min),
            3 => Ok(ReduceMode::Max),
            4 => Ok(ReduceMode::Sum),
            other => Err(BenchError::Config(format!(
                "invalid average mode {other}: expected 0 (rank0), 1 (mean), 2 (min), 3 (max) or 4 (sum)"
            ))),
        }
    }

    pub fn flag(self) -> i64 {
        match self {
            ReduceMode::RankZero => 0,
            ReduceMode::Mean => 1,
            ReduceMode::Min => 2,
            ReduceMode::Max => 3,
            ReduceMode::Sum => 4,
        }
    }
}

impl std::fmt::Display for ReduceMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReduceMode::RankZero => f.write_str("rank0"),
            ReduceMode::Mean => f.write_str("mean"),
            ReduceMode::Min => f.write_str("min"),
            ReduceMode::Max => f.write_str("max"),
            ReduceMode::Sum => f.write_str("sum"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_codes() {
        assert_eq!(Transport::LocalFastPath.code(), 0);
        assert_eq!(Transport::RemoteFabric(0).code(), 1);
        assert_eq!(Transport::RemoteFabric(7).code(), 8);
        for code in 0..=8u8 {
            assert_eq!(Transport::from_code(code).map(Transport::code), Some(code));
        }
        assert_eq!(Transport::from_code(9), None);
    }

    #[test]
    fn test_fabric_bounds() {
        assert_eq!(Transport::fabric(7).unwrap(), Transport::RemoteFabric(7));
        assert!(Transport::fabric(8).is_err());
    }

    #[test]
    fn test_transport_set_union() {
        let set = Transport::LocalFastPath | Transport::RemoteFabric(2);
        assert!(set.contains(Transport::LocalFastPath));
        assert!(set.contains(Transport::RemoteFabric(2)));
        assert!(!set.contains(Transport::RemoteFabric(1)));
        assert_eq!(set.iter().count(), 2);
        assert_eq!(set.to_string(), "{ipc|fabric2}");
        assert_eq!(TransportSet::from_bits(set.bits()), set);
    }

    #[test]
    fn test_empty_set() {
        assert!(TransportSet::empty().is_empty());
        assert!(TransportSet::from_bits(0xfe00).is_empty());
    }

    #[test]
    fn test_reduce_mode_flags() {
        for flag in 0..=4 {
            assert_eq!(ReduceMode::from_flag(flag).unwrap().flag(), flag);
        }
        assert!(ReduceMode::from_flag(5).is_err());
        assert!(ReduceMode::from_flag(-1).is_err());
    }

    #[test]
    fn test_priority_repr() {
        assert_eq!(Priority::Critical as u8, 0);
        assert_eq!(Priority::Realtime as u8, 1);
    }
}
