//! 엔진 전용 스레드
//!
//! [`Instance`]를 전용 스레드(current-thread tokio 런타임)로 옮기고,
//! 애플리케이션 스레드와는 bounded 채널로만 통신한다.
//!
//! ```text
//! app ── Command(closure) ──▶ engine thread (Instance::next_event 루프)
//! app ◀──────── Event ─────── engine thread
//! ```
//!
//! 이벤트 큐가 가득 차면 엔진은 네트워크 처리를 멈추고 애플리케이션이 이벤트를
//! 소비할 때까지 기다린다 (명령은 계속 처리).

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::config::InstanceConfig;
use crate::event::Event;
use crate::instance::Instance;
use crate::{Error, Result};

/// 명령 큐 크기
const COMMAND_QUEUE_SIZE: usize = 256;

/// 유휴 시 최대 대기 (명령은 Notify로 즉시 깨움)
const IDLE_WAIT: Duration = Duration::from_secs(1);

/// 이벤트 큐가 가득 찼을 때 재시도 간격
const BACKLOG_RETRY: Duration = Duration::from_millis(5);

type Job = Box<dyn FnOnce(&mut Instance) + Send>;

enum Command {
    Run(Job),
    Shutdown,
}

/// 엔진 스레드 핸들
///
/// drop 시 엔진을 종료하고 스레드를 join한다.
pub struct EngineThread {
    commands: Sender<Command>,
    events: Receiver<Event>,
    notify: Arc<Notify>,
    handle: Option<JoinHandle<()>>,
}

impl EngineThread {
    /// 엔진 스레드 시작
    pub fn spawn(config: InstanceConfig) -> Result<Self> {
        let (cmd_tx, cmd_rx) = bounded::<Command>(COMMAND_QUEUE_SIZE);
        let (event_tx, event_rx) = bounded::<Event>(config.event_queue_capacity.max(1));
        let (init_tx, init_rx) = bounded::<Result<()>>(1);
        let notify = Arc::new(Notify::new());
        let engine_notify = notify.clone();

        let handle = thread::Builder::new()
            .name("norm-engine".into())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = init_tx.send(Err(Error::Io(e)));
                        return;
                    }
                };
                runtime.block_on(async move {
                    let instance = match Instance::new(config) {
                        Ok(instance) => instance,
                        Err(e) => {
                            let _ = init_tx.send(Err(e));
                            return;
                        }
                    };
                    let _ = init_tx.send(Ok(()));
                    run(instance, cmd_rx, event_tx, engine_notify).await;
                });
            })?;

        match init_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = handle.join();
                return Err(e);
            }
            Err(_) => {
                let _ = handle.join();
                return Err(Error::EngineStopped);
            }
        }

        info!("엔진 스레드 시작");
        Ok(Self {
            commands: cmd_tx,
            events: event_rx,
            notify,
            handle: Some(handle),
        })
    }

    fn submit(&self, command: Command) -> Result<()> {
        self.commands.send(command).map_err(|_| Error::EngineStopped)?;
        self.notify.notify_one();
        Ok(())
    }

    /// 엔진 스레드에서 `f`를 실행하고 결과를 기다림
    pub fn call<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut Instance) -> R + Send + 'static,
    {
        let (reply_tx, reply_rx) = bounded(1);
        self.submit(Command::Run(Box::new(move |instance| {
            let _ = reply_tx.send(f(instance));
        })))?;
        reply_rx.recv().map_err(|_| Error::EngineStopped)
    }

    /// 엔진 스레드에서 `f`를 실행 (결과를 기다리지 않음)
    pub fn execute<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut Instance) + Send + 'static,
    {
        self.submit(Command::Run(Box::new(f)))
    }

    /// 다음 이벤트 (`timeout`이 None이면 무한 대기)
    ///
    /// 엔진이 종료되고 남은 이벤트도 없으면 `Err(EngineStopped)`.
    pub fn next_event(&self, timeout: Option<Duration>) -> Result<Option<Event>> {
        match timeout {
            Some(timeout) => match self.events.recv_timeout(timeout) {
                Ok(event) => Ok(Some(event)),
                Err(RecvTimeoutError::Timeout) => Ok(None),
                Err(RecvTimeoutError::Disconnected) => Err(Error::EngineStopped),
            },
            None => self.events.recv().map(Some).map_err(|_| Error::EngineStopped),
        }
    }

    /// 이벤트 수신 채널 (`crossbeam_channel::select!`용)
    pub fn events(&self) -> &Receiver<Event> {
        &self.events
    }

    /// 엔진 종료 후 스레드 join
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        // 명령 큐가 가득 차도 종료는 전달되어야 함
        while let Err(TrySendError::Full(_)) = self.commands.try_send(Command::Shutdown) {
            self.notify.notify_one();
            thread::sleep(BACKLOG_RETRY);
        }
        self.notify.notify_one();
        if handle.join().is_err() {
            error!("엔진 스레드 panic");
        }
        info!("엔진 스레드 종료");
    }
}

impl Drop for EngineThread {
    fn drop(&mut self) {
        self.stop();
    }
}

/// 엔진 루프
async fn run(
    mut instance: Instance,
    commands: Receiver<Command>,
    events: Sender<Event>,
    notify: Arc<Notify>,
) {
    let mut backlog: VecDeque<Event> = VecDeque::new();
    loop {
        loop {
            match commands.try_recv() {
                Ok(Command::Run(job)) => job(&mut instance),
                Ok(Command::Shutdown) | Err(TryRecvError::Disconnected) => {
                    debug!("엔진 루프 종료");
                    return;
                }
                Err(TryRecvError::Empty) => break,
            }
        }

        while let Some(event) = backlog.pop_front() {
            match events.try_send(event) {
                Ok(()) => {}
                Err(TrySendError::Full(event)) => {
                    backlog.push_front(event);
                    break;
                }
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
        if !backlog.is_empty() {
            tokio::select! {
                _ = notify.notified() => {}
                _ = tokio::time::sleep(BACKLOG_RETRY) => {}
            }
            continue;
        }

        tokio::select! {
            result = instance.next_event(Some(IDLE_WAIT)) => match result {
                Ok(Some(event)) => backlog.push_back(event),
                Ok(None) => {}
                Err(e) => {
                    error!("엔진 소켓 오류, 종료: {}", e);
                    return;
                }
            },
            _ = notify.notified() => {}
        }
    }
}
