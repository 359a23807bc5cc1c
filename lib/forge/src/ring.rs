/// Virtual points generated per unit of weight.
pub const POINTS_PER_SERVER: usize = 160;

/// Sorted ketama ring of `(point, server_index)` pairs. Immutable between
/// server-list mutations; lookups are `upper_bound` with wrap-around.
pub struct Ring {
    points: Vec<(u32, usize)>,
}

impl Ring {
    pub fn empty() -> Ring {
        Ring { points: Vec::new() }
    }

    /// Builds the ring for `servers` as `(name, weight)` pairs. Points are
    /// generated by hashing `"name-i"` through the configured hash. With
    /// `weighted` set, each server contributes `⌊160·w/Σw⌋ × N` points,
    /// otherwise a flat 160.
    pub fn build<H: Fn(&[u8]) -> u32>(servers: &[(String, u32)], hash: H, weighted: bool) -> Ring {
        if servers.is_empty() {
            return Ring::empty();
        }

        let total_weight: u64 = servers.iter().map(|(_, weight)| u64::from(*weight)).sum();
        let server_count = servers.len();
        let mut points = Vec::new();

        for (index, (name, weight)) in servers.iter().enumerate() {
            let count = if weighted {
                (POINTS_PER_SERVER as u64 * u64::from(*weight) / total_weight) as usize
                    * server_count
            } else {
                POINTS_PER_SERVER
            };

            for probe in 0..count {
                let spot = format!("{}-{}", name, probe);
                points.push((hash(spot.as_bytes()), index));
            }
        }

        // Point ties break on the server cursor so the ring order is total.
        points.sort_unstable();

        Ring { points }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    #[inline]
    pub fn points(&self) -> &[(u32, usize)] {
        &self.points
    }

    /// Position of the first point past `hash`, wrapped.
    #[inline]
    pub fn position(&self, hash: u32) -> usize {
        let position = self.points.partition_point(|&(point, _)| point <= hash);
        if position == self.points.len() {
            0
        } else {
            position
        }
    }

    /// Server owning `hash`.
    #[inline]
    pub fn lookup(&self, hash: u32) -> Option<usize> {
        if self.points.is_empty() {
            return None;
        }
        Some(self.points[self.position(hash)].1)
    }

    /// Server at `offset` ring positions past the owner of `hash`. Used to
    /// probe past dead servers during redistribution.
    #[inline]
    pub fn lookup_offset(&self, hash: u32, offset: usize) -> Option<usize> {
        if self.points.is_empty() {
            return None;
        }
        let position = (self.position(hash) + offset) % self.points.len();
        Some(self.points[position].1)
    }
}
