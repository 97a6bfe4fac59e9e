//! 통합 테스트 공용: 가상 시계 + 메모리 네트워크
//!
//! 모든 세션은 같은 멀티캐스트 그룹 주소를 쓰고, 노드마다 고유한 출발지 주소를
//! 가진다. 그룹으로 보낸 데이터그램은 다른 모든 노드에 `loss` 확률로 손실되어
//! 전달되고, 유니캐스트는 손실 없이 목적지 노드에만 전달된다.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::{Duration, Instant};

use norm_engine::message::Message;
use norm_engine::{Event, EventKind, NodeId, Session, SessionConfig};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// 무한 루프 방지용 최대 스텝 수
const MAX_STEPS: usize = 5_000_000;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn group() -> SocketAddr {
    "239.1.2.3:6003".parse().unwrap()
}

/// 재현 가능한 테스트 데이터
pub fn random_bytes(len: usize, seed: u64) -> Vec<u8> {
    let mut data = vec![0u8; len];
    StdRng::seed_from_u64(seed).fill(data.as_mut_slice());
    data
}

/// 전송 기록
#[derive(Debug, Clone)]
pub struct SentPacket {
    pub at: Instant,
    pub from: usize,
    pub len: usize,
    pub kind: &'static str,
}

pub struct Node {
    pub session: Session,
    pub addr: SocketAddr,
    pub events: Vec<Event>,
    /// RX_OBJECT_UPDATED 시점의 bytes_pending
    pub progress: Vec<u64>,
}

impl Node {
    pub fn has_event(&self, kind: &EventKind) -> bool {
        self.events.iter().any(|e| &e.kind == kind)
    }

    pub fn find_event(&self, kind: &EventKind) -> Option<&Event> {
        self.events.iter().find(|e| &e.kind == kind)
    }

    pub fn count_events(&self, kind: &EventKind) -> usize {
        self.events.iter().filter(|e| &e.kind == kind).count()
    }
}

pub struct Network {
    pub now: Instant,
    pub nodes: Vec<Node>,
    /// 편도 지연
    pub delay: Duration,
    /// 그룹 전달 손실률 (수신 노드별 독립)
    pub loss: f64,
    pub sent: Vec<SentPacket>,
    rng: StdRng,
    seed: u64,
    queue: BTreeMap<(Instant, u64), (usize, SocketAddr, Vec<u8>)>,
    seq: u64,
}

impl Network {
    pub fn new(seed: u64) -> Self {
        init_tracing();
        Self {
            now: Instant::now(),
            nodes: Vec::new(),
            delay: Duration::from_millis(5),
            loss: 0.0,
            sent: Vec::new(),
            rng: StdRng::seed_from_u64(seed),
            seed,
            queue: BTreeMap::new(),
            seq: 0,
        }
    }

    /// 노드 추가. 반환값은 노드 인덱스
    pub fn add_node(&mut self, node_id: NodeId, config: SessionConfig, cache_dir: &Path) -> usize {
        let index = self.nodes.len();
        let addr = SocketAddr::from(([10, 0, 0, index as u8 + 1], 5000));
        let session = Session::new(
            index as u32 + 1,
            group(),
            node_id,
            config,
            cache_dir,
            Some(self.seed.wrapping_add(node_id as u64)),
            self.now,
        )
        .unwrap();
        self.nodes.push(Node {
            session,
            addr,
            events: Vec::new(),
            progress: Vec::new(),
        });
        index
    }

    pub fn session(&mut self, index: usize) -> &mut Session {
        &mut self.nodes[index].session
    }

    fn route(&mut self, from: usize, destination: SocketAddr, contents: Vec<u8>) {
        let kind = Message::from_bytes(&contents)
            .map(|m| m.body().name())
            .unwrap_or("?");
        self.sent.push(SentPacket {
            at: self.now,
            from,
            len: contents.len(),
            kind,
        });

        let src = self.nodes[from].addr;
        let at = self.now + self.delay;
        if destination == group() {
            for to in 0..self.nodes.len() {
                if to == from || self.rng.gen::<f64>() < self.loss {
                    continue;
                }
                self.seq += 1;
                self.queue.insert((at, self.seq), (to, src, contents.clone()));
            }
        } else if let Some(to) = self.nodes.iter().position(|n| n.addr == destination) {
            self.seq += 1;
            self.queue.insert((at, self.seq), (to, src, contents));
        }
    }

    fn flush(&mut self) {
        let now = self.now;
        for from in 0..self.nodes.len() {
            while let Some(transmit) = self.nodes[from].session.poll_transmit(now) {
                self.route(from, transmit.destination, transmit.contents);
            }
            let node = &mut self.nodes[from];
            while let Some(event) = node.session.poll_event() {
                if event.kind == EventKind::RxObjectUpdated {
                    if let Some(object) = &event.object {
                        node.progress.push(object.bytes_pending());
                    }
                }
                node.events.push(event);
            }
        }
    }

    /// 다음 시점으로 진행. 더 할 일이 없으면 false
    pub fn step(&mut self) -> bool {
        self.flush();
        let next_packet = self.queue.keys().next().map(|(at, _)| *at);
        let next_timer = self
            .nodes
            .iter()
            .filter_map(|n| n.session.poll_timeout())
            .min();
        let Some(next) = [next_packet, next_timer].into_iter().flatten().min() else {
            return false;
        };
        self.now = self.now.max(next);

        while let Some(entry) = self.queue.first_entry() {
            if entry.key().0 > self.now {
                break;
            }
            let (to, src, contents) = entry.remove();
            self.nodes[to]
                .session
                .handle_datagram(self.now, src, &contents, false);
        }
        let now = self.now;
        for node in &mut self.nodes {
            if matches!(node.session.poll_timeout(), Some(at) if at <= now) {
                node.session.handle_timeout(now);
            }
        }
        self.flush();
        true
    }

    /// `done`이 참이 되거나 가상 시간 `limit`이 지날 때까지 진행
    pub fn run_until(&mut self, limit: Duration, mut done: impl FnMut(&Network) -> bool) -> bool {
        let deadline = self.now + limit;
        for _ in 0..MAX_STEPS {
            if done(self) {
                return true;
            }
            if self.now > deadline || !self.step() {
                return done(self);
            }
        }
        false
    }
}
