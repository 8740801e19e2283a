//! Named admission limiters for dispatch flow control.
//!
//! Three limiter shapes exist: exempt (always admits), max-requests-inflight
//! (a counting semaphore whose permit is held for the whole request), and a
//! token bucket (non-blocking: no token means reject, the upstream is the
//! queue). Limiters are reconciled by name: a parameter change resizes the
//! existing limiter in place so in-flight permits stay attached to it, and a
//! removed limiter drains before it is dropped (its `Arc` lives as long as
//! any outstanding permit).

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use tracing::warn;

use crate::config::{FlowControl, FlowStrategy};

/// A single named limiter.
#[derive(Debug)]
pub enum FlowLimiter {
    Exempt,
    MaxInflight(MaxInflight),
    TokenBucket(TokenBucket),
}

impl FlowLimiter {
    fn new(strategy: FlowStrategy) -> Self {
        match strategy {
            FlowStrategy::Exempt => Self::Exempt,
            FlowStrategy::MaxRequestsInflight { max } => Self::MaxInflight(MaxInflight::new(max)),
            FlowStrategy::TokenBucket { qps, burst } => {
                Self::TokenBucket(TokenBucket::new(qps, burst))
            }
        }
    }

    /// Whether `strategy` can be applied to this limiter without replacing it.
    fn same_shape(&self, strategy: FlowStrategy) -> bool {
        matches!(
            (self, strategy),
            (Self::Exempt, FlowStrategy::Exempt)
                | (Self::MaxInflight(_), FlowStrategy::MaxRequestsInflight { .. })
                | (Self::TokenBucket(_), FlowStrategy::TokenBucket { .. })
        )
    }

    /// Adjust parameters in place. Only valid for a same-shape strategy.
    fn resize(&self, strategy: FlowStrategy) {
        match (self, strategy) {
            (Self::Exempt, FlowStrategy::Exempt) => {}
            (Self::MaxInflight(m), FlowStrategy::MaxRequestsInflight { max }) => m.resize(max),
            (Self::TokenBucket(tb), FlowStrategy::TokenBucket { qps, burst }) => {
                tb.resize(qps, burst)
            }
            _ => unreachable!("resize called across limiter shapes"),
        }
    }

    /// Try to admit one request. Non-blocking.
    fn try_admit(self: &Arc<Self>) -> Option<Permit> {
        match &**self {
            Self::Exempt => Some(Permit::unlimited()),
            Self::MaxInflight(m) => {
                if m.try_acquire() {
                    Some(Permit {
                        held: Some(Arc::clone(self)),
                    })
                } else {
                    None
                }
            }
            // Token consumption is instantaneous; nothing to give back.
            Self::TokenBucket(tb) => tb.try_take().then(Permit::unlimited),
        }
    }
}

impl fmt::Display for FlowLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exempt => write!(f, "exempt"),
            Self::MaxInflight(m) => {
                write!(f, "maxRequestsInflight(max={})", m.max.load(Ordering::Relaxed))
            }
            Self::TokenBucket(tb) => {
                let state = tb.state.lock();
                write!(f, "tokenBucket(qps={}, burst={})", state.qps, state.burst)
            }
        }
    }
}

/// Counting semaphore with lazy shrink: lowering `max` below current usage
/// blocks new admissions until releases bring usage back under the cap.
#[derive(Debug)]
pub struct MaxInflight {
    max: AtomicU32,
    in_flight: AtomicU32,
}

impl MaxInflight {
    fn new(max: u32) -> Self {
        Self {
            max: AtomicU32::new(max),
            in_flight: AtomicU32::new(0),
        }
    }

    fn try_acquire(&self) -> bool {
        let max = self.max.load(Ordering::Relaxed);
        let mut current = self.in_flight.load(Ordering::Relaxed);
        loop {
            if current >= max {
                return false;
            }
            match self.in_flight.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    fn release(&self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }

    fn resize(&self, max: u32) {
        self.max.store(max, Ordering::Relaxed);
    }

    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::Relaxed)
    }
}

/// Leaky token bucket: tokens accrue at `qps` per second up to `burst`.
#[derive(Debug)]
pub struct TokenBucket {
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    qps: f64,
    burst: f64,
    tokens: f64,
    last_refill: Instant,
}

impl BucketState {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.qps).min(self.burst);
        self.last_refill = now;
    }
}

impl TokenBucket {
    fn new(qps: f64, burst: u32) -> Self {
        Self {
            state: Mutex::new(BucketState {
                qps,
                burst: f64::from(burst),
                // A fresh bucket starts full.
                tokens: f64::from(burst),
                last_refill: Instant::now(),
            }),
        }
    }

    fn try_take(&self) -> bool {
        let mut state = self.state.lock();
        state.refill(Instant::now());
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Apply new parameters. Accrued tokens survive except where they exceed
    /// the new burst cap.
    fn resize(&self, qps: f64, burst: u32) {
        let mut state = self.state.lock();
        // Settle accrual at the old rate before switching.
        state.refill(Instant::now());
        state.qps = qps;
        state.burst = f64::from(burst);
        state.tokens = state.tokens.min(state.burst);
    }

    #[cfg(test)]
    fn rewind(&self, by: std::time::Duration) {
        let mut state = self.state.lock();
        state.last_refill -= by;
    }

    #[cfg(test)]
    fn tokens(&self) -> f64 {
        self.state.lock().tokens
    }
}

/// Admission grant. Dropping it returns capacity; [`Permit::release`] does
/// the same eagerly and is idempotent.
#[derive(Debug)]
pub struct Permit {
    held: Option<Arc<FlowLimiter>>,
}

impl Permit {
    fn unlimited() -> Self {
        Self { held: None }
    }

    pub fn release(&mut self) {
        if let Some(limiter) = self.held.take()
            && let FlowLimiter::MaxInflight(m) = &*limiter
        {
            m.release();
        }
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.release();
    }
}

/// The per-cluster set of named limiters.
///
/// Readers admit under a read lock; [`FlowControlMap::sync`] runs under the
/// cluster reconfiguration lock and is the only writer.
#[derive(Debug, Default)]
pub struct FlowControlMap {
    limiters: RwLock<HashMap<String, Arc<FlowLimiter>>>,
}

impl FlowControlMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit one request through the named schema.
    ///
    /// An unknown or absent schema name is treated as exempt: dispatch
    /// policies without flow control must never be throttled by accident.
    pub fn admit(&self, schema: Option<&str>) -> Option<Permit> {
        let Some(name) = schema else {
            return Some(Permit::unlimited());
        };
        let limiters = self.limiters.read().expect("flow map lock poisoned");
        match limiters.get(name) {
            Some(limiter) => limiter.try_admit(),
            None => Some(Permit::unlimited()),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<FlowLimiter>> {
        self.limiters
            .read()
            .expect("flow map lock poisoned")
            .get(name)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.limiters.read().expect("flow map lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reconcile the limiter set against `desired`.
    ///
    /// Same name and shape: resize in place, preserving limiter identity so
    /// in-flight permits stay accounted. Shape change or new name: fresh
    /// limiter. Names absent from `desired` are dropped from the map; their
    /// storage drains once outstanding permits release.
    pub fn sync(&self, cluster: &str, desired: &FlowControl) {
        let mut limiters = self.limiters.write().expect("flow map lock poisoned");
        let mut retained: HashMap<String, Arc<FlowLimiter>> =
            HashMap::with_capacity(desired.schemas.len());
        for schema in &desired.schemas {
            let strategy = match schema.strategy() {
                Ok(strategy) => strategy,
                Err(error) => {
                    // Validation happens at load time; reaching this means a
                    // caller skipped it. Keep the previous limiter if any.
                    warn!(cluster, schema = %schema.name, %error, "skipping invalid flow control schema");
                    if let Some(existing) = limiters.remove(&schema.name) {
                        retained.insert(schema.name.clone(), existing);
                    }
                    continue;
                }
            };
            match limiters.remove(&schema.name) {
                Some(existing) if existing.same_shape(strategy) => {
                    existing.resize(strategy);
                    retained.insert(schema.name.clone(), existing);
                }
                _ => {
                    retained.insert(schema.name.clone(), Arc::new(FlowLimiter::new(strategy)));
                }
            }
        }
        *limiters = retained;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        ExemptSchema, FlowControlSchema, MaxRequestsInflightSchema, TokenBucketSchema,
    };

    fn exempt_schema(name: &str) -> FlowControlSchema {
        FlowControlSchema {
            name: name.into(),
            exempt: Some(ExemptSchema {}),
            ..Default::default()
        }
    }

    fn inflight_schema(name: &str, max: u32) -> FlowControlSchema {
        FlowControlSchema {
            name: name.into(),
            max_requests_inflight: Some(MaxRequestsInflightSchema { max }),
            ..Default::default()
        }
    }

    fn bucket_schema(name: &str, qps: f64, burst: u32) -> FlowControlSchema {
        FlowControlSchema {
            name: name.into(),
            token_bucket: Some(TokenBucketSchema { qps, burst }),
            ..Default::default()
        }
    }

    fn flow_control(schemas: Vec<FlowControlSchema>) -> FlowControl {
        FlowControl { schemas }
    }

    #[test]
    fn unknown_schema_is_exempt() {
        let map = FlowControlMap::new();
        assert!(map.admit(Some("nope")).is_some());
        assert!(map.admit(None).is_some());
    }

    #[test]
    fn max_inflight_conserves_permits() {
        let map = FlowControlMap::new();
        map.sync("test", &flow_control(vec![inflight_schema("cap", 2)]));

        let first = map.admit(Some("cap")).expect("first");
        let second = map.admit(Some("cap")).expect("second");
        assert!(map.admit(Some("cap")).is_none(), "third must be rejected");

        drop(first);
        let third = map.admit(Some("cap")).expect("after release");
        drop(second);
        drop(third);

        let limiter = map.get("cap").unwrap();
        let FlowLimiter::MaxInflight(m) = &*limiter else {
            panic!("wrong shape");
        };
        assert_eq!(m.in_flight(), 0);
    }

    #[test]
    fn release_is_idempotent() {
        let map = FlowControlMap::new();
        map.sync("test", &flow_control(vec![inflight_schema("cap", 1)]));
        let mut permit = map.admit(Some("cap")).expect("admit");
        permit.release();
        permit.release();
        drop(permit);
        let limiter = map.get("cap").unwrap();
        let FlowLimiter::MaxInflight(m) = &*limiter else {
            panic!("wrong shape");
        };
        assert_eq!(m.in_flight(), 0);
    }

    #[test]
    fn token_bucket_rejects_when_empty() {
        let map = FlowControlMap::new();
        map.sync("test", &flow_control(vec![bucket_schema("tb", 1.0, 2)]));
        assert!(map.admit(Some("tb")).is_some());
        assert!(map.admit(Some("tb")).is_some());
        assert!(map.admit(Some("tb")).is_none(), "burst exhausted");
    }

    #[test]
    fn token_bucket_refills_over_time() {
        let map = FlowControlMap::new();
        map.sync("test", &flow_control(vec![bucket_schema("tb", 10.0, 1)]));
        assert!(map.admit(Some("tb")).is_some());
        assert!(map.admit(Some("tb")).is_none());

        let limiter = map.get("tb").unwrap();
        let FlowLimiter::TokenBucket(tb) = &*limiter else {
            panic!("wrong shape");
        };
        // 10 qps for half a second accrues five tokens, capped at burst 1.
        tb.rewind(std::time::Duration::from_millis(500));
        assert!(map.admit(Some("tb")).is_some());
    }

    #[test]
    fn resize_preserves_limiter_identity() {
        let map = FlowControlMap::new();
        map.sync(
            "test",
            &flow_control(vec![inflight_schema("cap", 1), bucket_schema("tb", 10.0, 20)]),
        );
        let cap_before = map.get("cap").unwrap();
        let tb_before = map.get("tb").unwrap();

        // A permit held across the resize stays accounted.
        let held = map.admit(Some("cap")).expect("admit");

        map.sync(
            "test",
            &flow_control(vec![inflight_schema("cap", 2), bucket_schema("tb", 20.0, 40)]),
        );
        assert!(Arc::ptr_eq(&cap_before, &map.get("cap").unwrap()));
        assert!(Arc::ptr_eq(&tb_before, &map.get("tb").unwrap()));
        assert_eq!(map.get("cap").unwrap().to_string(), "maxRequestsInflight(max=2)");
        assert_eq!(map.get("tb").unwrap().to_string(), "tokenBucket(qps=20, burst=40)");

        drop(held);
        let FlowLimiter::MaxInflight(m) = &*map.get("cap").unwrap() else {
            panic!("wrong shape");
        };
        assert_eq!(m.in_flight(), 0);
    }

    #[test]
    fn shrinking_max_inflight_blocks_until_drained() {
        let map = FlowControlMap::new();
        map.sync("test", &flow_control(vec![inflight_schema("cap", 2)]));
        let a = map.admit(Some("cap")).expect("a");
        let _b = map.admit(Some("cap")).expect("b");

        map.sync("test", &flow_control(vec![inflight_schema("cap", 1)]));
        assert!(map.admit(Some("cap")).is_none(), "over new cap");
        drop(a);
        assert!(map.admit(Some("cap")).is_none(), "still at new cap");
    }

    #[test]
    fn growing_qps_does_not_drop_tokens() {
        let map = FlowControlMap::new();
        map.sync("test", &flow_control(vec![bucket_schema("tb", 10.0, 20)]));
        let limiter = map.get("tb").unwrap();
        let FlowLimiter::TokenBucket(tb) = &*limiter else {
            panic!("wrong shape");
        };
        let before = tb.tokens();

        map.sync("test", &flow_control(vec![bucket_schema("tb", 50.0, 20)]));
        assert!(tb.tokens() >= before, "qps growth must not drop tokens");

        // Burst shrink clamps to the new cap.
        map.sync("test", &flow_control(vec![bucket_schema("tb", 50.0, 5)]));
        assert!(tb.tokens() <= 5.0);
    }

    #[test]
    fn shape_change_replaces_the_limiter() {
        let map = FlowControlMap::new();
        map.sync("test", &flow_control(vec![inflight_schema("x", 1)]));
        let before = map.get("x").unwrap();
        map.sync("test", &flow_control(vec![bucket_schema("x", 1.0, 1)]));
        let after = map.get("x").unwrap();
        assert!(!Arc::ptr_eq(&before, &after));
        assert!(matches!(&*after, FlowLimiter::TokenBucket(_)));
    }

    #[test]
    fn removed_schemas_are_dropped() {
        let map = FlowControlMap::new();
        map.sync(
            "test",
            &flow_control(vec![
                exempt_schema("exempt"),
                inflight_schema("cap", 1),
                bucket_schema("tb", 1.0, 1),
            ]),
        );
        assert_eq!(map.len(), 3);

        map.sync("test", &flow_control(vec![]));
        assert!(map.is_empty());
    }
}
