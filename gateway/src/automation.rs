use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tokio::{
    sync::{watch, Mutex, Notify},
    task::JoinHandle,
};
use tracing::{info, warn};

use farm_common::{RuleEngine, Trigger};

use crate::{
    dispatcher::{CommandQueue, Dispatcher},
    poller::PollState,
};

/// Runs one evaluation against `state` and dispatches every action of every
/// newly active rule.
pub async fn run_cycle<Q: CommandQueue>(
    engine: &Mutex<RuleEngine>,
    dispatcher: &Dispatcher<Q>,
    state: &PollState,
) -> Vec<Trigger> {
    let triggers = engine
        .lock()
        .await
        .evaluate(&state.snapshot, state.connected);

    for trigger in &triggers {
        info!("rule {} triggered: {}", trigger.rule_id, trigger.rule_name);
        let location = format!("automation:{}", trigger.rule_id);
        for code in &trigger.actions {
            let metadata = json!({
                "rule_id": trigger.rule_id,
                "rule_name": trigger.rule_name,
            });
            let outcome = dispatcher.dispatch_code(*code, &location, metadata).await;
            if let Err(err) = &outcome.command {
                warn!("rule {} could not send {}: {err}", trigger.rule_id, code.kind());
            }
        }
        engine
            .lock()
            .await
            .record_execution(trigger, &state.snapshot, Utc::now());
    }

    triggers
}

/// Re-evaluates on every published poll state and whenever `rules_changed`
/// is notified.
pub fn spawn_automation_loop<Q>(
    engine: Arc<Mutex<RuleEngine>>,
    rules_changed: Arc<Notify>,
    mut poll_state: watch::Receiver<PollState>,
    dispatcher: Arc<Dispatcher<Q>>,
) -> JoinHandle<()>
where
    Q: CommandQueue + 'static,
{
    tokio::spawn(async move {
        loop {
            tokio::select! {
                changed = poll_state.changed() => {
                    if changed.is_err() {
                        info!("poller stopped, automation loop exiting");
                        break;
                    }
                }
                _ = rules_changed.notified() => {}
            }

            let state = poll_state.borrow_and_update().clone();
            run_cycle(&engine, dispatcher.as_ref(), &state).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::testing::FakeQueue;
    use farm_common::{
        rules::{RuleActions, RuleConditions},
        ActionCode, AutomationMode, Bound, DispatcherConfig, MissingReading, Rule,
        SensorSnapshot, SnapshotSource,
    };
    use pretty_assertions::assert_eq;

    fn fan_rule() -> Rule {
        Rule {
            id: "heat".to_string(),
            name: "Heat".to_string(),
            description: String::new(),
            conditions: RuleConditions {
                temperature: Some(Bound::at_least(28.0)),
                ..Default::default()
            },
            actions: RuleActions {
                fan: true,
                ..Default::default()
            },
            enabled: true,
            priority: 1,
        }
    }

    fn state(temperature: f64, connected: bool) -> PollState {
        let mut snapshot = SensorSnapshot::empty(SnapshotSource::Live, Utc::now());
        snapshot.temperature = Some(temperature);
        PollState {
            snapshot,
            connected,
            last_error: None,
            cycle: 1,
        }
    }

    fn started_engine() -> Mutex<RuleEngine> {
        let mut engine = RuleEngine::new(vec![fan_rule()], MissingReading::Unsatisfied);
        engine.start();
        Mutex::new(engine)
    }

    fn dispatcher() -> Dispatcher<FakeQueue> {
        Dispatcher::new(FakeQueue::default(), "farm_001", &DispatcherConfig::default())
    }

    #[tokio::test]
    async fn hot_reading_sends_fan_once() {
        let engine = started_engine();
        let dispatcher = dispatcher();

        let first = run_cycle(&engine, &dispatcher, &state(30.0, true)).await;
        let second = run_cycle(&engine, &dispatcher, &state(30.5, true)).await;

        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
        let commands = dispatcher.queue_for_tests().commands.lock().unwrap().clone();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].action, ActionCode::Fan);
        assert_eq!(commands[0].location, "automation:heat");

        let engine = engine.lock().await;
        assert_eq!(engine.stats().rules_triggered, 1);
        assert_eq!(engine.execution_log().count(), 1);
    }

    #[tokio::test]
    async fn fallback_data_never_triggers() {
        let engine = started_engine();
        let dispatcher = dispatcher();

        assert!(run_cycle(&engine, &dispatcher, &state(40.0, false)).await.is_empty());
        assert!(dispatcher.queue_for_tests().commands.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn manual_mode_suppresses_dispatch() {
        let engine = started_engine();
        engine.lock().await.set_mode(AutomationMode::Manual);
        let dispatcher = dispatcher();

        assert!(run_cycle(&engine, &dispatcher, &state(30.0, true)).await.is_empty());
    }

    #[tokio::test]
    async fn loop_reacts_to_published_state() {
        let engine = Arc::new(started_engine());
        let dispatcher = Arc::new(dispatcher());
        let (tx, rx) = watch::channel(PollState::initial());
        let handle = spawn_automation_loop(
            engine.clone(),
            Arc::new(Notify::new()),
            rx,
            dispatcher.clone(),
        );

        tx.send_replace(state(31.0, true));
        for _ in 0..50 {
            if engine.lock().await.stats().rules_triggered > 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(engine.lock().await.stats().rules_triggered, 1);

        drop(tx);
        handle.await.unwrap();
    }
}
