//! Page/segment size constants and the relation fork enumeration, a
//! minimal analogue of `postgres_ffi::pg_constants` scoped to what the
//! core reconstruction and replication-session code needs.

/// Default page size. Negotiated per-server at connect time in real
/// deployments; kept as a constant default here since the wire protocol
/// always reports it during `IDENTIFY_SYSTEM`/cluster introspection.
pub const BLCKSZ: u32 = 8192;

/// Number of blocks per relation segment file (so each segment is
/// `RELSEG_SIZE * BLCKSZ` bytes, commonly 1 GiB).
pub const RELSEG_SIZE: u32 = 131_072;

/// Default WAL segment size, 16 MiB.
pub const WAL_SEGMENT_SIZE: u64 = 16 * 1024 * 1024;

/// The origin's timeline id type.
pub type TimeLineId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ForkNumber {
    Main,
    Fsm,
    Vm,
    Init,
}

impl ForkNumber {
    pub fn as_suffix(self) -> &'static str {
        match self {
            ForkNumber::Main => "",
            ForkNumber::Fsm => "_fsm",
            ForkNumber::Vm => "_vm",
            ForkNumber::Init => "_init",
        }
    }

    /// The free-space-map fork is never WAL-summarized and is always taken
    /// in full (spec.md §4.6 "The free-space-map fork is always taken in
    /// full").
    pub fn always_full_copy(self) -> bool {
        matches!(self, ForkNumber::Fsm)
    }
}

/// `(tablespace_oid, database_oid, relation_number, fork, segment_no)`
/// from spec.md §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RelFileLocator {
    pub tablespace_oid: u32,
    pub database_oid: u32,
    pub relation_number: u32,
    pub fork: ForkNumber,
    pub segment_no: u32,
}

impl RelFileLocator {
    /// The on-disk basename for this locator within the data directory,
    /// e.g. `16384.1_fsm` for segment 1 of the FSM fork of relation 16384.
    pub fn basename(&self) -> String {
        let mut s = self.relation_number.to_string();
        s.push_str(self.fork.as_suffix());
        if self.segment_no > 0 {
            s.push('.');
            s.push_str(&self.segment_no.to_string());
        }
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basename_formatting() {
        let loc = RelFileLocator {
            tablespace_oid: 1663,
            database_oid: 16384,
            relation_number: 16385,
            fork: ForkNumber::Main,
            segment_no: 0,
        };
        assert_eq!(loc.basename(), "16385");

        let loc2 = RelFileLocator {
            segment_no: 2,
            fork: ForkNumber::Fsm,
            ..loc
        };
        assert_eq!(loc2.basename(), "16385_fsm.2");
    }

    #[test]
    fn fsm_is_always_full_copy() {
        assert!(ForkNumber::Fsm.always_full_copy());
        assert!(!ForkNumber::Main.always_full_copy());
    }
}
