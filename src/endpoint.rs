use std::os::fd::RawFd;

/// Lightweight identifier for a connection, usable as a map key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Endpoint {
    pub fd: RawFd,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn orders_by_descriptor() {
        let mut map = BTreeMap::new();
        map.insert(Endpoint { fd: 9 }, "b");
        map.insert(Endpoint { fd: 3 }, "a");
        let keys: Vec<_> = map.keys().map(|e| e.fd).collect();
        assert_eq!(keys, vec![3, 9]);
    }
}
