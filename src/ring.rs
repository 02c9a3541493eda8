/// Stable assignment of work items to daemon processes.
///
/// Sync rows are partitioned by object key; migrations are partitioned by
/// container name. The assignment depends only on the hashed name and the
/// process count, never on row ids, so reshuffled feeds land on the same
/// owner.
#[derive(Debug, Clone)]
pub struct Ring {
    processes: u64,
    process_index: u64,
    name: String,
}

impl Ring {
    pub fn new(name: &str, processes: u64, process_index: u64) -> Self {
        assert!(processes > 0, "ring requires at least one process");
        assert!(process_index < processes, "process index out of range");
        Self {
            processes,
            process_index,
            name: name.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Slot for an arbitrary key.
    pub fn slot(&self, key: &str) -> u64 {
        stable_hash(key) % self.processes
    }

    /// Whether this process owns the key.
    pub fn owns(&self, key: &str) -> bool {
        self.slot(key) == self.process_index
    }
}

/// First eight bytes of the md5 of the key, big-endian. md5 here is a
/// partitioning hash, not an integrity check.
fn stable_hash(key: &str) -> u64 {
    let digest = md5::compute(key.as_bytes());
    u64::from_be_bytes(digest.0[..8].try_into().unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_key_has_exactly_one_owner() {
        let rings: Vec<Ring> = (0..4).map(|i| Ring::new("container", 4, i)).collect();
        for key in ["a", "b", "container-x", "AUTH_test/c/obj", "héllo-🚀"] {
            let owners = rings.iter().filter(|r| r.owns(key)).count();
            assert_eq!(owners, 1, "key {key} owned by {owners} processes");
        }
    }

    #[test]
    fn assignment_is_stable() {
        let ring = Ring::new("container", 8, 3);
        let slot = ring.slot("some/object/key");
        for _ in 0..100 {
            assert_eq!(ring.slot("some/object/key"), slot);
        }
    }

    #[test]
    fn single_process_owns_everything() {
        let ring = Ring::new("container", 1, 0);
        assert!(ring.owns("anything"));
        assert!(ring.owns(""));
    }

    #[test]
    #[should_panic]
    fn index_must_be_less_than_processes() {
        Ring::new("container", 2, 2);
    }
}
