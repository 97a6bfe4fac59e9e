//! Acking 노드 (워터마크 positive ACK 대상) 관리

use std::collections::BTreeMap;

use bytes::Bytes;

use crate::{NodeId, NODE_ANY};

/// 워터마크 ACK 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckingStatus {
    /// 알 수 없는 노드 / 워터마크 없음
    Invalid,
    /// ACK 대기
    Pending,
    /// ACK 수신
    Success,
    /// 재시도 소진
    Failure,
}

#[derive(Debug, Clone)]
struct AckingNode {
    status: AckingStatus,
    /// 노드가 ACK에 실어 보낸 데이터
    ack_payload: Option<Bytes>,
}

/// Acking 노드 테이블
#[derive(Debug, Default)]
pub struct AckingNodeTable {
    nodes: BTreeMap<NodeId, AckingNode>,
    watermark_set: bool,
}

impl AckingNodeTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.nodes.contains_key(&node)
    }

    /// 노드 추가. 새 노드면 true
    ///
    /// 진행 중인 워터마크가 있으면 새 노드도 ACK 대상이 된다.
    pub fn add(&mut self, node: NodeId) -> bool {
        if node == NODE_ANY || self.nodes.contains_key(&node) {
            return false;
        }
        let status = if self.watermark_set {
            AckingStatus::Pending
        } else {
            AckingStatus::Invalid
        };
        self.nodes.insert(
            node,
            AckingNode {
                status,
                ack_payload: None,
            },
        );
        true
    }

    pub fn remove(&mut self, node: NodeId) -> bool {
        self.nodes.remove(&node).is_some()
    }

    pub fn ids(&self) -> Vec<NodeId> {
        self.nodes.keys().copied().collect()
    }

    /// 새 워터마크: 모든 노드를 PENDING으로
    pub fn arm(&mut self) {
        self.watermark_set = true;
        for node in self.nodes.values_mut() {
            node.status = AckingStatus::Pending;
            node.ack_payload = None;
        }
    }

    /// 워터마크 재시도: FAILURE 노드만 PENDING으로
    pub fn rearm_failures(&mut self) {
        self.watermark_set = true;
        for node in self.nodes.values_mut() {
            if node.status == AckingStatus::Failure {
                node.status = AckingStatus::Pending;
            }
        }
    }

    /// 워터마크 취소
    pub fn disarm(&mut self) {
        self.watermark_set = false;
    }

    pub fn is_armed(&self) -> bool {
        self.watermark_set
    }

    /// ACK 수신. PENDING → SUCCESS 전이가 일어나면 true
    pub fn acknowledge(&mut self, node: NodeId, payload: Option<Bytes>) -> bool {
        match self.nodes.get_mut(&node) {
            Some(entry) if entry.status == AckingStatus::Pending => {
                entry.status = AckingStatus::Success;
                entry.ack_payload = payload;
                true
            }
            _ => false,
        }
    }

    /// 남은 PENDING 노드를 FAILURE로
    pub fn fail_pending(&mut self) {
        for node in self.nodes.values_mut() {
            if node.status == AckingStatus::Pending {
                node.status = AckingStatus::Failure;
            }
        }
    }

    /// 아직 ACK하지 않은 노드
    pub fn pending(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|(_, n)| n.status == AckingStatus::Pending)
            .map(|(&id, _)| id)
            .collect()
    }

    pub fn has_pending(&self) -> bool {
        self.nodes.values().any(|n| n.status == AckingStatus::Pending)
    }

    /// 노드 상태. `NODE_ANY`는 전체 요약 (PENDING > FAILURE > SUCCESS)
    pub fn status(&self, node: NodeId) -> AckingStatus {
        if !self.watermark_set {
            return AckingStatus::Invalid;
        }
        if node != NODE_ANY {
            return self
                .nodes
                .get(&node)
                .map(|n| n.status)
                .unwrap_or(AckingStatus::Invalid);
        }

        let mut summary = AckingStatus::Success;
        for n in self.nodes.values() {
            match n.status {
                AckingStatus::Pending => return AckingStatus::Pending,
                AckingStatus::Failure => summary = AckingStatus::Failure,
                _ => {}
            }
        }
        summary
    }

    pub fn ack_payload(&self, node: NodeId) -> Option<Bytes> {
        self.nodes.get(&node).and_then(|n| n.ack_payload.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_before_watermark() {
        let mut table = AckingNodeTable::new();
        assert!(table.add(1));
        assert!(!table.add(1));
        assert!(!table.add(NODE_ANY));
        assert_eq!(table.status(1), AckingStatus::Invalid);
        assert_eq!(table.status(NODE_ANY), AckingStatus::Invalid);
    }

    #[test]
    fn test_watermark_success() {
        let mut table = AckingNodeTable::new();
        table.add(1);
        table.add(2);
        table.arm();
        assert_eq!(table.status(NODE_ANY), AckingStatus::Pending);
        assert_eq!(table.pending(), vec![1, 2]);

        assert!(table.acknowledge(1, Some(Bytes::from_static(b"ok"))));
        assert!(!table.acknowledge(1, None));
        assert_eq!(table.status(1), AckingStatus::Success);
        assert_eq!(table.status(NODE_ANY), AckingStatus::Pending);

        table.acknowledge(2, None);
        assert_eq!(table.status(NODE_ANY), AckingStatus::Success);
        assert_eq!(table.ack_payload(1), Some(Bytes::from_static(b"ok")));
        assert_eq!(table.status(9), AckingStatus::Invalid);
    }

    #[test]
    fn test_failure_and_reset() {
        let mut table = AckingNodeTable::new();
        table.add(1);
        table.add(2);
        table.arm();
        table.acknowledge(1, None);
        table.fail_pending();
        assert_eq!(table.status(2), AckingStatus::Failure);
        assert_eq!(table.status(NODE_ANY), AckingStatus::Failure);

        table.rearm_failures();
        assert_eq!(table.status(1), AckingStatus::Success);
        assert_eq!(table.status(2), AckingStatus::Pending);
    }

    #[test]
    fn test_node_added_during_watermark_is_pending() {
        let mut table = AckingNodeTable::new();
        table.arm();
        assert_eq!(table.status(NODE_ANY), AckingStatus::Success);
        table.add(5);
        assert_eq!(table.status(5), AckingStatus::Pending);
        assert!(table.remove(5));
        assert_eq!(table.status(NODE_ANY), AckingStatus::Success);
    }
}
