//! 객체 캐시 한계 관리
//!
//! - 송신측: `(size_max, count_min, count_max)` 한계. 한계를 넘으면 전송이 끝난
//!   오래된 객체부터 퍼지하고, 퍼지할 수 없으면 enqueue를 거부한다 (백프레셔).
//! - 수신측: 원격 송신자당 동시 수신 객체 수와 수신 버퍼 공간 한계.

use std::collections::VecDeque;

use crate::object::ObjectId;
use crate::{Error, Result};

/// 송신 캐시 한계
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxCacheBounds {
    /// 캐시 총 바이트 한계
    pub size_max: u64,

    /// 크기 한계와 무관하게 유지하는 최소 객체 수
    pub count_min: usize,

    /// 최대 객체 수
    pub count_max: usize,
}

impl Default for TxCacheBounds {
    fn default() -> Self {
        Self {
            size_max: 20 * 1024 * 1024, // 20MB
            count_min: 8,
            count_max: 256,
        }
    }
}

impl TxCacheBounds {
    pub fn validate(&self) -> Result<()> {
        if self.count_max == 0 || self.count_min > self.count_max {
            return Err(Error::InvalidParameter(format!(
                "tx 캐시 객체 수: min {} / max {}",
                self.count_min, self.count_max
            )));
        }
        Ok(())
    }

    fn exceeded(&self, count: usize, total: u64) -> bool {
        count > self.count_max || (total > self.size_max && count > self.count_min)
    }
}

/// 송신 캐시 (enqueue 순서 유지)
#[derive(Debug)]
pub struct TxCache {
    bounds: TxCacheBounds,
    entries: VecDeque<(ObjectId, u64)>,
    total_size: u64,
}

impl TxCache {
    pub fn new(bounds: TxCacheBounds) -> Self {
        Self {
            bounds,
            entries: VecDeque::new(),
            total_size: 0,
        }
    }

    pub fn bounds(&self) -> TxCacheBounds {
        self.bounds
    }

    pub fn set_bounds(&mut self, bounds: TxCacheBounds) {
        self.bounds = bounds;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.entries.iter().any(|&(e, _)| e == id)
    }

    /// 가장 오래된 객체 ID
    pub fn oldest(&self) -> Option<ObjectId> {
        self.entries.front().map(|&(id, _)| id)
    }

    pub fn ids(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.entries.iter().map(|&(id, _)| id)
    }

    /// `size` 바이트 객체의 수용 계획
    ///
    /// 수용 가능하면 먼저 퍼지해야 할 객체 목록 (오래된 순)을, 퍼지 불가능한
    /// 객체에 막혀 한계를 지킬 수 없으면 `None`을 반환한다.
    pub fn plan_admission(
        &self,
        size: u64,
        purgeable: impl Fn(ObjectId) -> bool,
    ) -> Option<Vec<ObjectId>> {
        let mut count = self.entries.len();
        let mut total = self.total_size;
        let mut evict = Vec::new();

        for &(id, obj_size) in &self.entries {
            if !self.bounds.exceeded(count + 1, total + size) {
                break;
            }
            if !purgeable(id) {
                return None;
            }
            evict.push(id);
            count -= 1;
            total -= obj_size;
        }

        if self.bounds.exceeded(count + 1, total + size) {
            None
        } else {
            Some(evict)
        }
    }

    pub fn insert(&mut self, id: ObjectId, size: u64) {
        self.entries.push_back((id, size));
        self.total_size += size;
    }

    pub fn remove(&mut self, id: ObjectId) -> bool {
        match self.entries.iter().position(|&(e, _)| e == id) {
            Some(pos) => {
                if let Some((_, size)) = self.entries.remove(pos) {
                    self.total_size -= size;
                }
                true
            }
            None => false,
        }
    }
}

/// 수신 객체 수용 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxAdmission {
    Accept,
    /// 객체가 수신 버퍼 공간보다 큼
    Overflow,
    /// 동시 수신 한계 초과: 가장 오래된 객체를 중단하고 수용
    EvictOldest(ObjectId),
}

/// 수신 캐시 한계
#[derive(Debug, Clone, Copy)]
pub struct RxCache {
    buffer_space: u64,
    count_max: usize,
}

impl RxCache {
    pub fn new(buffer_space: u64, count_max: usize) -> Self {
        Self {
            buffer_space,
            count_max: count_max.max(1),
        }
    }

    pub fn buffer_space(&self) -> u64 {
        self.buffer_space
    }

    pub fn set_count_max(&mut self, count_max: usize) {
        self.count_max = count_max.max(1);
    }

    pub fn count_max(&self) -> usize {
        self.count_max
    }

    /// 새 수신 객체 수용 판단 (`active`는 진행 중 객체, 오래된 순)
    pub fn admit(&self, size: u64, active: &[ObjectId]) -> RxAdmission {
        if size > self.buffer_space {
            return RxAdmission::Overflow;
        }
        match active.first() {
            Some(&oldest) if active.len() >= self.count_max => RxAdmission::EvictOldest(oldest),
            _ => RxAdmission::Accept,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bounds(size_max: u64, count_min: usize, count_max: usize) -> TxCacheBounds {
        TxCacheBounds {
            size_max,
            count_min,
            count_max,
        }
    }

    #[test]
    fn test_rejects_exactly_at_count_bound() {
        let mut cache = TxCache::new(bounds(u64::MAX, 0, 3));
        for id in 0..3 {
            assert_eq!(cache.plan_admission(10, |_| false), Some(vec![]));
            cache.insert(id, 10);
        }
        assert_eq!(cache.plan_admission(10, |_| false), None);
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn test_rejects_exactly_at_size_bound() {
        let mut cache = TxCache::new(bounds(100, 1, 100));
        cache.insert(0, 60);
        assert_eq!(cache.plan_admission(40, |_| false), Some(vec![]));
        assert_eq!(cache.plan_admission(41, |_| false), None);
    }

    #[test]
    fn test_count_min_ignores_size() {
        let mut cache = TxCache::new(bounds(100, 2, 10));
        assert_eq!(cache.plan_admission(500, |_| false), Some(vec![]));
        cache.insert(0, 500);
        assert_eq!(cache.plan_admission(500, |_| false), Some(vec![]));
        cache.insert(1, 500);
        assert_eq!(cache.plan_admission(1, |_| false), None);
    }

    #[test]
    fn test_purges_oldest_sent_objects() {
        let mut cache = TxCache::new(bounds(u64::MAX, 0, 2));
        cache.insert(0, 10);
        cache.insert(1, 10);

        assert_eq!(cache.plan_admission(10, |id| id == 0), Some(vec![0]));
        // 가장 오래된 객체가 전송 중이면 거부
        assert_eq!(cache.plan_admission(10, |id| id == 1), None);

        assert!(cache.remove(0));
        assert!(!cache.remove(0));
        assert_eq!(cache.total_size(), 10);
        assert_eq!(cache.oldest(), Some(1));
    }

    #[test]
    fn test_rx_admission() {
        let cache = RxCache::new(1000, 2);
        assert_eq!(cache.admit(1001, &[]), RxAdmission::Overflow);
        assert_eq!(cache.admit(1000, &[3]), RxAdmission::Accept);
        assert_eq!(cache.admit(10, &[3, 4]), RxAdmission::EvictOldest(3));
    }
}
