use std::sync::OnceLock;

use super::mesh::Mesh;

static GLOBAL: OnceLock<Mesh> = OnceLock::new();

/// Process-wide mesh for applications that cannot pass one around.
///
/// Constructed on first use; concurrent first callers all observe the same
/// instance. Prefer an explicitly owned [`Mesh`] where possible.
#[must_use]
pub fn global() -> &'static Mesh {
    GLOBAL.get_or_init(Mesh::new)
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn concurrent_first_use_yields_one_instance() {
        let addrs: Vec<usize> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| s.spawn(|| std::ptr::from_ref(global()) as usize))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert!(addrs.windows(2).all(|w| w[0] == w[1]));
    }
}
