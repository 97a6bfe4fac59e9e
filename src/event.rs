//! 엔진 이벤트
//!
//! 이벤트는 생성 후 변경되지 않으며 애플리케이션이 한 번 소비한다.
//! 같은 세션의 이벤트는 감지 순서대로 전달된다.

use std::fmt;

use bytes::Bytes;

use crate::node::AckingStatus;
use crate::object::Object;
use crate::session::SessionId;
use crate::NodeId;

/// 이벤트 종류
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    /// 송신 캐시 / 스트림 버퍼에 공간이 생김
    TxQueueVacancy,
    /// 전송할 새 데이터가 없음
    TxQueueEmpty,
    /// flush 완료
    TxFlushCompleted,
    /// 워터마크 ACK 수집 종료 (전체 요약 상태)
    TxWatermarkCompleted(AckingStatus),
    /// 애플리케이션 명령 전송 완료
    TxCmdSent,
    /// 객체 첫 전송 완료
    TxObjectSent,
    /// 객체가 송신 캐시에서 해제됨
    TxObjectPurged,
    /// 혼잡 제어에 의한 송신 속도 변경
    TxRateChanged,
    /// 송신자 종료 완료
    LocalSenderClosed,
    RemoteSenderNew,
    /// 원격 송신자 재시작 (인스턴스 변경)
    RemoteSenderReset,
    /// 원격 송신자 주소 변경
    RemoteSenderAddress,
    RemoteSenderActive,
    RemoteSenderInactive,
    /// 원격 송신자 상태 삭제
    RemoteSenderPurged,
    /// 애플리케이션 명령 수신
    RxCmdNew(Bytes),
    RxObjectNew,
    RxObjectInfo,
    /// 수신 진행 (bytes_pending 감소)
    RxObjectUpdated,
    RxObjectCompleted,
    RxObjectAborted,
    /// 워터마크 요청에 실린 애플리케이션 데이터
    RxAckRequest(Bytes),
    GrttUpdated,
    CcActive,
    CcInactive,
    /// 자동 추적으로 새 acking 노드 추가
    AckingNodeNew,
    /// 소켓 전송 실패
    SendError,
    /// 사용자 타이머 만료
    UserTimeout,
    Invalid,
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::TxQueueVacancy => "TX_QUEUE_VACANCY",
            EventKind::TxQueueEmpty => "TX_QUEUE_EMPTY",
            EventKind::TxFlushCompleted => "TX_FLUSH_COMPLETED",
            EventKind::TxWatermarkCompleted(_) => "TX_WATERMARK_COMPLETED",
            EventKind::TxCmdSent => "TX_CMD_SENT",
            EventKind::TxObjectSent => "TX_OBJECT_SENT",
            EventKind::TxObjectPurged => "TX_OBJECT_PURGED",
            EventKind::TxRateChanged => "TX_RATE_CHANGED",
            EventKind::LocalSenderClosed => "LOCAL_SENDER_CLOSED",
            EventKind::RemoteSenderNew => "REMOTE_SENDER_NEW",
            EventKind::RemoteSenderReset => "REMOTE_SENDER_RESET",
            EventKind::RemoteSenderAddress => "REMOTE_SENDER_ADDRESS",
            EventKind::RemoteSenderActive => "REMOTE_SENDER_ACTIVE",
            EventKind::RemoteSenderInactive => "REMOTE_SENDER_INACTIVE",
            EventKind::RemoteSenderPurged => "REMOTE_SENDER_PURGED",
            EventKind::RxCmdNew(_) => "RX_CMD_NEW",
            EventKind::RxObjectNew => "RX_OBJECT_NEW",
            EventKind::RxObjectInfo => "RX_OBJECT_INFO",
            EventKind::RxObjectUpdated => "RX_OBJECT_UPDATED",
            EventKind::RxObjectCompleted => "RX_OBJECT_COMPLETED",
            EventKind::RxObjectAborted => "RX_OBJECT_ABORTED",
            EventKind::RxAckRequest(_) => "RX_ACK_REQUEST",
            EventKind::GrttUpdated => "GRTT_UPDATED",
            EventKind::CcActive => "CC_ACTIVE",
            EventKind::CcInactive => "CC_INACTIVE",
            EventKind::AckingNodeNew => "ACKING_NODE_NEW",
            EventKind::SendError => "SEND_ERROR",
            EventKind::UserTimeout => "USER_TIMEOUT",
            EventKind::Invalid => "INVALID",
        }
    }
}

/// 엔진 이벤트
#[derive(Debug, Clone)]
pub struct Event {
    pub session: SessionId,
    pub kind: EventKind,
    /// 관련 원격 노드 (원격 송신자 / acking 노드)
    pub sender: Option<NodeId>,
    pub object: Option<Object>,
}

impl Event {
    pub fn new(session: SessionId, kind: EventKind) -> Self {
        Self {
            session,
            kind,
            sender: None,
            object: None,
        }
    }

    pub fn with_sender(mut self, sender: NodeId) -> Self {
        self.sender = Some(sender);
        self
    }

    pub fn with_object(mut self, object: Object) -> Self {
        self.object = Some(object);
        self
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} session={}", self.kind.name(), self.session)?;
        if let Some(sender) = self.sender {
            write!(f, " node={}", sender)?;
        }
        if let Some(object) = &self.object {
            write!(f, " object={}", object.id())?;
        }
        if let EventKind::TxWatermarkCompleted(status) = &self.kind {
            write!(f, " status={:?}", status)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let event = Event::new(3, EventKind::TxWatermarkCompleted(AckingStatus::Success)).with_sender(7);
        assert_eq!(
            event.to_string(),
            "TX_WATERMARK_COMPLETED session=3 node=7 status=Success"
        );
        assert_eq!(EventKind::RxCmdNew(Bytes::new()).name(), "RX_CMD_NEW");
    }
}
