/// The cluster runtime event loop.
///
/// A single async task that owns `MembershipState` and multiplexes over
/// inbound frames, application commands, and the next protocol deadline.
use std::time::Duration;

use tokio::sync::mpsc;

use crate::types::now_ms;

use super::effect::Inbound;
use super::executor::execute_effects;
use super::state::MembershipState;
use super::transport::Transport;
use super::{ClusterEvent, DeliveredData, RuntimeCommand, StopReason};

/// Main event loop. Returns why it stopped.
pub(super) async fn runtime_loop<T: Transport>(
    mut state: MembershipState,
    transport: T,
    mut inbound_rx: mpsc::Receiver<Inbound>,
    mut cmd_rx: mpsc::Receiver<RuntimeCommand>,
    event_tx: mpsc::Sender<ClusterEvent>,
    data_tx: mpsc::Sender<DeliveredData>,
) -> StopReason {
    let local_id = state.local_id();
    let effects = state.start(now_ms());
    let mut stop = execute_effects(effects, &transport, &event_tx, &data_tx).await;
    let mut inbound_open = true;

    while stop.is_none() {
        let now = now_ms();
        let sleep_for = Duration::from_millis(state.next_wakeup(now).saturating_sub(now));

        tokio::select! {
            // ── 1. Frames from the network ───────────────────────
            inbound = inbound_rx.recv(), if inbound_open => {
                let Some(inbound) = inbound else {
                    tracing::warn!(node = %local_id, "inbound channel closed");
                    inbound_open = false;
                    continue;
                };
                let effects = state.handle_message(inbound, now_ms());
                stop = execute_effects(effects, &transport, &event_tx, &data_tx).await;
            }

            // ── 2. Commands from the application ─────────────────
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else {
                    // Every handle dropped.
                    stop = Some(StopReason::Shutdown);
                    break;
                };
                stop = handle_command(&mut state, cmd, &transport, &event_tx, &data_tx).await;
            }

            // ── 3. Timers ────────────────────────────────────────
            _ = tokio::time::sleep(sleep_for) => {
                let effects = state.tick(now_ms());
                stop = execute_effects(effects, &transport, &event_tx, &data_tx).await;
            }
        }
    }

    let reason = stop.unwrap_or(StopReason::Shutdown);
    transport.shutdown().await;
    tracing::info!(node = %local_id, ?reason, "cluster runtime stopped");
    reason
}

async fn handle_command<T: Transport>(
    state: &mut MembershipState,
    cmd: RuntimeCommand,
    transport: &T,
    event_tx: &mpsc::Sender<ClusterEvent>,
    data_tx: &mpsc::Sender<DeliveredData>,
) -> Option<StopReason> {
    let now = now_ms();
    match cmd {
        RuntimeCommand::Leave => {
            let effects = state.leave(now);
            execute_effects(effects, transport, event_tx, data_tx).await
        }
        RuntimeCommand::Register { kind, name } => match state.register_resource(kind, name, now) {
            Ok(effects) => execute_effects(effects, transport, event_tx, data_tx).await,
            Err(e) => {
                let _ = event_tx.try_send(ClusterEvent::Error {
                    description: e.to_string(),
                });
                None
            }
        },
        RuntimeCommand::ProposeConfig { changes, reply } => match state.propose_config(changes, now) {
            Ok((version, effects)) => {
                let _ = reply.send(Ok(version));
                execute_effects(effects, transport, event_tx, data_tx).await
            }
            Err(e) => {
                let _ = reply.send(Err(e));
                None
            }
        },
        RuntimeCommand::SendData {
            to,
            topic,
            body,
            reply,
        } => match state.send_data(to, topic, body, now) {
            Ok(effects) => {
                let _ = reply.send(Ok(()));
                execute_effects(effects, transport, event_tx, data_tx).await
            }
            Err(e) => {
                let _ = reply.send(Err(e));
                None
            }
        },
        RuntimeCommand::GetState { reply } => {
            let _ = reply.send(Some((state.state(), state.epoch())));
            None
        }
        RuntimeCommand::GetConfig { reply } => {
            let store = state.config_store();
            let _ = reply.send((store.version(), store.entries().clone()));
            None
        }
        RuntimeCommand::Shutdown => {
            let _ = event_tx.try_send(ClusterEvent::Stopped {
                reason: StopReason::Shutdown,
            });
            Some(StopReason::Shutdown)
        }
    }
}
