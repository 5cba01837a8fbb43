//! Backend selection policies.
//!
//! Four policies over the roster: round-robin, smooth weighted round-robin,
//! weight-adjusted least-connections, and consistent IP hash. All of them
//! return a roster index; the caller dials and owns the failure handling.
//!
//! When every backend is unhealthy, round-robin (and the policies that
//! delegate to it) still returns a best-effort index so the caller can
//! attempt the dial and surface a proper error response.

use crate::backend::Roster;
use crate::config::Algorithm;

pub struct Balancer {
    algorithm: Algorithm,
    rr_index: usize,
}

impl Balancer {
    pub fn new(algorithm: Algorithm) -> Self {
        Self {
            algorithm,
            rr_index: 0,
        }
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn set_algorithm(&mut self, algorithm: Algorithm) {
        if self.algorithm != algorithm {
            self.algorithm = algorithm;
            self.rr_index = 0;
        }
    }

    /// Pick a backend for a client. `None` only when the roster is empty.
    pub fn select(&mut self, roster: &mut Roster, client_ip: &str) -> Option<usize> {
        if roster.is_empty() {
            return None;
        }
        match self.algorithm {
            Algorithm::RoundRobin => self.round_robin(roster),
            Algorithm::Weighted => self.weighted(roster),
            Algorithm::LeastConnections => self.least_connections(roster),
            Algorithm::IpHash => Some(ip_hash(roster, client_ip)),
        }
    }

    fn round_robin(&mut self, roster: &Roster) -> Option<usize> {
        let n = roster.len();
        let start = self.rr_index;
        for i in 1..=n {
            let idx = (start + i) % n;
            if roster.get(idx).is_some_and(|b| b.is_healthy) {
                self.rr_index = idx;
                return Some(idx);
            }
        }
        // Full cycle without a healthy backend: best-effort choice.
        let idx = (start + 1) % n;
        self.rr_index = idx;
        Some(idx)
    }

    fn weighted(&mut self, roster: &mut Roster) -> Option<usize> {
        let mut total: i64 = 0;
        let mut best: Option<(usize, i64)> = None;

        for (i, b) in roster.iter_mut().enumerate() {
            if !b.is_healthy {
                continue;
            }
            b.current_weight += b.weight as i64;
            total += b.weight as i64;
            if best.is_none_or(|(_, w)| b.current_weight > w) {
                best = Some((i, b.current_weight));
            }
        }

        match best {
            Some((winner, _)) => {
                if let Some(b) = roster.get_mut(winner) {
                    b.current_weight -= total;
                }
                Some(winner)
            }
            None => self.round_robin(roster),
        }
    }

    fn least_connections(&mut self, roster: &mut Roster) -> Option<usize> {
        let mut best: Option<(usize, u64)> = None;
        for (i, b) in roster.iter().enumerate() {
            if !b.is_healthy {
                continue;
            }
            let score = b.active_connections as u64 * 100 / b.weight.max(1) as u64;
            if best.is_none_or(|(_, s)| score < s) {
                best = Some((i, score));
            }
        }
        match best {
            Some((winner, _)) => Some(winner),
            None => self.round_robin(roster),
        }
    }
}

/// Deterministic hash-and-probe: the same client IP maps to the same
/// backend for as long as the roster and its health are stable.
fn ip_hash(roster: &Roster, client_ip: &str) -> usize {
    let n = roster.len();
    let hash = hash_key(client_ip);
    let start = hash as usize % n;
    for i in 0..n {
        let idx = (start + i) % n;
        if roster.get(idx).is_some_and(|b| b.is_healthy) {
            return idx;
        }
    }
    start
}

/// Polynomial string hash: `Σ cᵢ · 31^(len-1-i) mod 2³²`.
fn hash_key(key: &str) -> u32 {
    key.bytes()
        .fold(0u32, |h, c| h.wrapping_mul(31).wrapping_add(c as u32))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Roster;
    use crate::config::{BackendConfig, Config};

    fn roster(weights: &[u32]) -> Roster {
        let backends = weights
            .iter()
            .enumerate()
            .map(|(i, &weight)| BackendConfig {
                host: format!("backend-{i}"),
                port: 8000 + i as u16,
                weight,
                max_connections: 100,
            })
            .collect();
        Roster::from_config(&Config {
            backends,
            ..Config::default()
        })
    }

    #[test]
    fn round_robin_cycles_healthy_backends() {
        let mut roster = roster(&[1, 1, 1]);
        let mut balancer = Balancer::new(Algorithm::RoundRobin);

        let picks: Vec<_> = (0..6)
            .map(|_| balancer.select(&mut roster, "10.0.0.1").expect("pick"))
            .collect();
        assert_eq!(picks, vec![1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn round_robin_skips_unhealthy() {
        let mut roster = roster(&[1, 1, 1]);
        roster.get_mut(1).expect("b").is_healthy = false;
        let mut balancer = Balancer::new(Algorithm::RoundRobin);

        let picks: Vec<_> = (0..4)
            .map(|_| balancer.select(&mut roster, "10.0.0.1").expect("pick"))
            .collect();
        assert!(!picks.contains(&1));
    }

    #[test]
    fn round_robin_returns_best_effort_when_all_unhealthy() {
        let mut roster = roster(&[1, 1]);
        for b in roster.iter_mut() {
            b.is_healthy = false;
        }
        let mut balancer = Balancer::new(Algorithm::RoundRobin);
        assert!(balancer.select(&mut roster, "10.0.0.1").is_some());
    }

    #[test]
    fn select_returns_none_on_empty_roster() {
        let mut roster = roster(&[]);
        for algorithm in [
            Algorithm::RoundRobin,
            Algorithm::Weighted,
            Algorithm::LeastConnections,
            Algorithm::IpHash,
        ] {
            let mut balancer = Balancer::new(algorithm);
            assert!(balancer.select(&mut roster, "10.0.0.1").is_none());
        }
    }

    #[test]
    fn weighted_dispatches_proportionally_per_cycle() {
        let mut roster = roster(&[3, 2, 1]);
        let mut balancer = Balancer::new(Algorithm::Weighted);

        let mut counts = [0usize; 3];
        for _ in 0..600 {
            let idx = balancer.select(&mut roster, "10.0.0.1").expect("pick");
            counts[idx] += 1;
        }
        assert_eq!(counts, [300, 200, 100]);
    }

    #[test]
    fn weighted_first_cycle_is_the_accumulate_subtract_order() {
        let mut roster = roster(&[3, 2, 1]);
        let mut balancer = Balancer::new(Algorithm::Weighted);

        let picks: Vec<_> = (0..6)
            .map(|_| balancer.select(&mut roster, "10.0.0.1").expect("pick"))
            .collect();

        // Accumulate-max-subtract over weights 3,2,1: interleaved rather
        // than bursting, each backend exactly its weight per cycle.
        assert_eq!(picks, vec![0, 1, 0, 2, 1, 0]);

        // Every accumulator is back to zero at the cycle boundary, so the
        // next cycle repeats the same order.
        for b in roster.iter() {
            assert_eq!(b.current_weight, 0);
        }
        let second: Vec<_> = (0..6)
            .map(|_| balancer.select(&mut roster, "10.0.0.1").expect("pick"))
            .collect();
        assert_eq!(second, vec![0, 1, 0, 2, 1, 0]);
    }

    #[test]
    fn weighted_skips_unhealthy_and_falls_back() {
        let mut roster = roster(&[3, 2]);
        roster.get_mut(0).expect("a").is_healthy = false;
        let mut balancer = Balancer::new(Algorithm::Weighted);
        for _ in 0..5 {
            assert_eq!(balancer.select(&mut roster, "10.0.0.1"), Some(1));
        }
    }

    #[test]
    fn least_connections_is_weight_adjusted() {
        let mut roster = roster(&[4, 1]);
        roster.get_mut(0).expect("a").active_connections = 6;
        roster.get_mut(1).expect("b").active_connections = 2;
        let mut balancer = Balancer::new(Algorithm::LeastConnections);

        // a: 6*100/4 = 150, b: 2*100/1 = 200.
        assert_eq!(balancer.select(&mut roster, "10.0.0.1"), Some(0));
    }

    #[test]
    fn least_connections_breaks_ties_first_seen() {
        let mut roster = roster(&[1, 1]);
        let mut balancer = Balancer::new(Algorithm::LeastConnections);
        assert_eq!(balancer.select(&mut roster, "10.0.0.1"), Some(0));
    }

    #[test]
    fn ip_hash_is_sticky_for_a_fixed_roster() {
        let mut roster = roster(&[1, 1, 1, 1]);
        let mut balancer = Balancer::new(Algorithm::IpHash);

        let first = balancer.select(&mut roster, "203.0.113.7").expect("pick");
        for _ in 0..1000 {
            assert_eq!(balancer.select(&mut roster, "203.0.113.7"), Some(first));
        }
    }

    #[test]
    fn ip_hash_moves_once_and_stays_when_backend_goes_down() {
        let mut roster = roster(&[1, 1, 1, 1]);
        let mut balancer = Balancer::new(Algorithm::IpHash);

        let first = balancer.select(&mut roster, "203.0.113.7").expect("pick");
        roster.get_mut(first).expect("backend").is_healthy = false;

        let fallback = balancer.select(&mut roster, "203.0.113.7").expect("pick");
        assert_ne!(fallback, first);
        for _ in 0..100 {
            assert_eq!(balancer.select(&mut roster, "203.0.113.7"), Some(fallback));
        }
    }

    #[test]
    fn ip_hash_differs_across_clients() {
        let mut roster = roster(&[1, 1, 1, 1]);
        let mut balancer = Balancer::new(Algorithm::IpHash);

        let picks: std::collections::HashSet<_> = (0..32)
            .map(|i| {
                balancer
                    .select(&mut roster, &format!("198.51.100.{i}"))
                    .expect("pick")
            })
            .collect();
        assert!(picks.len() > 1, "hash should spread across the roster");
    }
}
