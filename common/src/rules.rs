use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    command::ActionCode,
    snapshot::{Metric, SensorSnapshot},
};

const EXECUTION_LOG_LEN: usize = 10;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Bound {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
}

impl Bound {
    pub fn at_least(min: f64) -> Self {
        Self {
            min: Some(min),
            max: None,
        }
    }

    pub fn at_most(max: f64) -> Self {
        Self {
            min: None,
            max: Some(max),
        }
    }

    pub fn contains(&self, value: f64) -> bool {
        self.min.is_none_or(|min| value >= min) && self.max.is_none_or(|max| value <= max)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleConditions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<Bound>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub humidity: Option<Bound>,
    #[serde(default, alias = "soilMoisture", skip_serializing_if = "Option::is_none")]
    pub soil_moisture: Option<Bound>,
    #[serde(default, alias = "lightLevel", skip_serializing_if = "Option::is_none")]
    pub light_level: Option<Bound>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance: Option<Bound>,
}

impl RuleConditions {
    pub fn bounds(&self) -> impl Iterator<Item = (Metric, &Bound)> {
        [
            (Metric::Temperature, self.temperature.as_ref()),
            (Metric::Humidity, self.humidity.as_ref()),
            (Metric::SoilMoisture, self.soil_moisture.as_ref()),
            (Metric::LightLevel, self.light_level.as_ref()),
            (Metric::Distance, self.distance.as_ref()),
        ]
        .into_iter()
        .filter_map(|(metric, bound)| bound.map(|bound| (metric, bound)))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleActions {
    #[serde(default)]
    pub fan: bool,
    #[serde(default)]
    pub led: bool,
    #[serde(default)]
    pub watering: bool,
    #[serde(default)]
    pub buzzer: bool,
    #[serde(default)]
    pub feeding: bool,
}

impl RuleActions {
    pub fn codes(&self) -> Vec<ActionCode> {
        [
            (self.fan, ActionCode::Fan),
            (self.led, ActionCode::Light),
            (self.watering, ActionCode::Water),
            (self.buzzer, ActionCode::Buzzer),
            (self.feeding, ActionCode::Feed),
        ]
        .into_iter()
        .filter_map(|(enabled, code)| enabled.then_some(code))
        .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub conditions: RuleConditions,
    #[serde(default)]
    pub actions: RuleActions,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub priority: i32,
}

fn default_enabled() -> bool {
    true
}

pub fn default_rules() -> Vec<Rule> {
    let rule = |id: &str, name: &str, description: &str, priority: i32| Rule {
        id: id.to_string(),
        name: name.to_string(),
        description: description.to_string(),
        conditions: RuleConditions::default(),
        actions: RuleActions::default(),
        enabled: true,
        priority,
    };

    vec![
        Rule {
            conditions: RuleConditions {
                temperature: Some(Bound::at_least(28.0)),
                ..Default::default()
            },
            actions: RuleActions {
                fan: true,
                ..Default::default()
            },
            ..rule("temp_control", "Temperature Control", "Auto fan activation when too hot", 1)
        },
        Rule {
            conditions: RuleConditions {
                soil_moisture: Some(Bound::at_most(30.0)),
                ..Default::default()
            },
            actions: RuleActions {
                watering: true,
                ..Default::default()
            },
            ..rule("drought_protection", "Drought Protection", "Auto watering when soil is dry", 2)
        },
        Rule {
            conditions: RuleConditions {
                light_level: Some(Bound::at_most(20.0)),
                ..Default::default()
            },
            actions: RuleActions {
                led: true,
                ..Default::default()
            },
            ..rule("night_lighting", "Night Lighting", "LED lighting when dark", 3)
        },
        Rule {
            conditions: RuleConditions {
                distance: Some(Bound::at_most(10.0)),
                ..Default::default()
            },
            actions: RuleActions {
                buzzer: true,
                ..Default::default()
            },
            ..rule("intruder_alert", "Intruder Alert", "Buzzer when something is too close", 4)
        },
        Rule {
            conditions: RuleConditions {
                temperature: Some(Bound::at_least(35.0)),
                humidity: Some(Bound::at_least(80.0)),
                ..Default::default()
            },
            actions: RuleActions {
                fan: true,
                led: true,
                buzzer: true,
                ..Default::default()
            },
            ..rule(
                "emergency_protocol",
                "Emergency Protocol",
                "Full system alert for extreme conditions",
                0,
            )
        },
    ]
}

/// How a bounded metric without a reading is judged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingReading {
    #[default]
    Unsatisfied,
    TreatAsZero,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutomationMode {
    #[default]
    Auto,
    Manual,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Trigger {
    pub rule_id: String,
    pub rule_name: String,
    pub actions: Vec<ActionCode>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionLogEntry {
    pub at: DateTime<Utc>,
    pub rule_id: String,
    pub rule_name: String,
    pub actions: Vec<&'static str>,
    pub snapshot: SensorSnapshot,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AutomationStats {
    pub rules_triggered: u64,
    pub actions_executed: u64,
}

/// Edge-triggered evaluator: a rule fires once when it becomes active and
/// stays silent until it has dropped out and come back.
#[derive(Debug, Clone)]
pub struct RuleEngine {
    rules: Vec<Rule>,
    missing: MissingReading,
    mode: AutomationMode,
    started: bool,
    active: Vec<String>,
    log: VecDeque<ExecutionLogEntry>,
    stats: AutomationStats,
}

impl RuleEngine {
    pub fn new(rules: Vec<Rule>, missing: MissingReading) -> Self {
        Self {
            rules,
            missing,
            mode: AutomationMode::Auto,
            started: false,
            active: Vec::new(),
            log: VecDeque::with_capacity(EXECUTION_LOG_LEN),
            stats: AutomationStats::default(),
        }
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn active(&self) -> &[String] {
        &self.active
    }

    pub fn mode(&self) -> AutomationMode {
        self.mode
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn stats(&self) -> AutomationStats {
        self.stats
    }

    pub fn execution_log(&self) -> impl Iterator<Item = &ExecutionLogEntry> {
        self.log.iter()
    }

    pub fn start(&mut self) {
        self.started = true;
    }

    pub fn set_mode(&mut self, mode: AutomationMode) -> bool {
        if self.mode != mode {
            self.mode = mode;
            true
        } else {
            false
        }
    }

    /// Flips a rule's `enabled` flag and returns the new value.
    pub fn toggle(&mut self, id: &str) -> Option<bool> {
        let rule = self.rules.iter_mut().find(|rule| rule.id == id)?;
        rule.enabled = !rule.enabled;
        Some(rule.enabled)
    }

    pub fn rule_matches(rule: &Rule, snapshot: &SensorSnapshot, missing: MissingReading) -> bool {
        rule.conditions.bounds().all(|(metric, bound)| {
            match (snapshot.value(metric), missing) {
                (Some(value), _) => bound.contains(value),
                (None, MissingReading::TreatAsZero) => bound.contains(0.0),
                (None, MissingReading::Unsatisfied) => false,
            }
        })
    }

    pub fn evaluate(&mut self, snapshot: &SensorSnapshot, connected: bool) -> Vec<Trigger> {
        if !self.started || self.mode != AutomationMode::Auto || !connected {
            self.active.clear();
            return Vec::new();
        }

        let mut ordered: Vec<&Rule> = self.rules.iter().filter(|rule| rule.enabled).collect();
        ordered.sort_by_key(|rule| rule.priority);

        let current: Vec<&Rule> = ordered
            .into_iter()
            .filter(|rule| Self::rule_matches(rule, snapshot, self.missing))
            .collect();

        let triggers = current
            .iter()
            .filter(|rule| !self.active.contains(&rule.id))
            .map(|rule| Trigger {
                rule_id: rule.id.clone(),
                rule_name: rule.name.clone(),
                actions: rule.actions.codes(),
            })
            .collect();

        self.active = current.into_iter().map(|rule| rule.id.clone()).collect();
        triggers
    }

    pub fn record_execution(
        &mut self,
        trigger: &Trigger,
        snapshot: &SensorSnapshot,
        at: DateTime<Utc>,
    ) {
        if self.log.len() == EXECUTION_LOG_LEN {
            self.log.pop_back();
        }
        self.log.push_front(ExecutionLogEntry {
            at,
            rule_id: trigger.rule_id.clone(),
            rule_name: trigger.rule_name.clone(),
            actions: trigger.actions.iter().map(|code| code.kind()).collect(),
            snapshot: snapshot.clone(),
        });
        self.stats.rules_triggered += 1;
        self.stats.actions_executed += trigger.actions.len() as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::SnapshotSource;
    use pretty_assertions::assert_eq;

    fn at() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn snapshot(temperature: Option<f64>, humidity: Option<f64>) -> SensorSnapshot {
        let mut snapshot = SensorSnapshot::empty(SnapshotSource::Live, at());
        snapshot.temperature = temperature;
        snapshot.humidity = humidity;
        snapshot
    }

    fn fan_rule(bound: Bound) -> Rule {
        Rule {
            id: "too_hot".to_string(),
            name: "Too hot".to_string(),
            description: String::new(),
            conditions: RuleConditions {
                temperature: Some(bound),
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

    fn started(rules: Vec<Rule>) -> RuleEngine {
        let mut engine = RuleEngine::new(rules, MissingReading::Unsatisfied);
        engine.start();
        engine
    }

    #[test]
    fn hot_snapshot_fires_fan_exactly_once() {
        let mut engine = started(vec![fan_rule(Bound::at_least(28.0))]);
        let hot = snapshot(Some(30.0), Some(60.0));

        let triggers = engine.evaluate(&hot, true);
        assert_eq!(
            triggers,
            vec![Trigger {
                rule_id: "too_hot".to_string(),
                rule_name: "Too hot".to_string(),
                actions: vec![ActionCode::Fan],
            }]
        );
        assert_eq!(engine.active(), ["too_hot".to_string()]);

        assert!(engine.evaluate(&hot, true).is_empty());
        assert_eq!(engine.active(), ["too_hot".to_string()]);
    }

    #[test]
    fn value_outside_range_is_inactive() {
        let mut engine = started(vec![fan_rule(Bound::at_most(28.0))]);
        assert!(engine.evaluate(&snapshot(Some(30.0), Some(60.0)), true).is_empty());
        assert!(engine.active().is_empty());
    }

    #[test]
    fn unbounded_metrics_are_ignored() {
        let rule = fan_rule(Bound::at_least(28.0));
        for humidity in [None, Some(0.0), Some(100.0)] {
            assert!(RuleEngine::rule_matches(
                &rule,
                &snapshot(Some(29.0), humidity),
                MissingReading::Unsatisfied
            ));
        }

        let mut no_conditions = rule.clone();
        no_conditions.conditions = RuleConditions::default();
        assert!(RuleEngine::rule_matches(
            &no_conditions,
            &snapshot(None, None),
            MissingReading::Unsatisfied
        ));
    }

    #[test]
    fn all_bounds_must_hold() {
        let rules = default_rules();
        let emergency = rules
            .iter()
            .find(|rule| rule.id == "emergency_protocol")
            .unwrap();

        let check = |t, h| RuleEngine::rule_matches(emergency, &snapshot(t, h), MissingReading::Unsatisfied);
        assert!(check(Some(36.0), Some(85.0)));
        assert!(!check(Some(36.0), Some(60.0)));
        assert!(!check(Some(30.0), Some(85.0)));
        assert!(check(Some(35.0), Some(80.0)));
    }

    #[test]
    fn zero_is_a_real_bound() {
        let bound = Bound {
            min: Some(0.0),
            max: Some(10.0),
        };
        assert!(bound.contains(0.0));
        assert!(!bound.contains(-0.5));
    }

    #[test]
    fn missing_reading_policy() {
        let rule = fan_rule(Bound::at_most(28.0));
        let offline = snapshot(None, None);

        assert!(!RuleEngine::rule_matches(&rule, &offline, MissingReading::Unsatisfied));
        assert!(RuleEngine::rule_matches(&rule, &offline, MissingReading::TreatAsZero));
    }

    #[test]
    fn rule_fires_again_after_dropping_out() {
        let mut engine = started(vec![fan_rule(Bound::at_least(28.0))]);

        assert_eq!(engine.evaluate(&snapshot(Some(30.0), None), true).len(), 1);
        assert!(engine.evaluate(&snapshot(Some(25.0), None), true).is_empty());
        assert!(engine.active().is_empty());
        assert_eq!(engine.evaluate(&snapshot(Some(31.0), None), true).len(), 1);
    }

    #[test]
    fn all_matching_rules_fire_in_priority_order() {
        let mut engine = started(default_rules());
        let mut extreme = snapshot(Some(36.0), Some(90.0));
        extreme.distance = Some(4.0);

        let fired: Vec<String> = engine
            .evaluate(&extreme, true)
            .into_iter()
            .map(|trigger| trigger.rule_id)
            .collect();
        assert_eq!(fired, vec!["emergency_protocol", "temp_control", "intruder_alert"]);
    }

    #[test]
    fn disconnected_or_manual_clears_active_set() {
        let mut engine = started(vec![fan_rule(Bound::at_least(28.0))]);
        let hot = snapshot(Some(30.0), None);

        assert_eq!(engine.evaluate(&hot, true).len(), 1);
        assert!(engine.evaluate(&hot, false).is_empty());
        assert!(engine.active().is_empty());
        assert_eq!(engine.evaluate(&hot, true).len(), 1);

        assert!(engine.set_mode(AutomationMode::Manual));
        assert!(engine.evaluate(&hot, true).is_empty());
        assert!(engine.active().is_empty());
    }

    #[test]
    fn not_started_never_fires() {
        let mut engine = RuleEngine::new(vec![fan_rule(Bound::at_least(28.0))], MissingReading::Unsatisfied);
        assert!(engine.evaluate(&snapshot(Some(40.0), None), true).is_empty());
    }

    #[test]
    fn toggled_rule_rises_when_reenabled() {
        let mut engine = started(vec![fan_rule(Bound::at_least(28.0))]);
        let hot = snapshot(Some(30.0), None);
        assert_eq!(engine.evaluate(&hot, true).len(), 1);

        assert_eq!(engine.toggle("too_hot"), Some(false));
        assert!(engine.evaluate(&hot, true).is_empty());
        assert_eq!(engine.toggle("too_hot"), Some(true));
        assert_eq!(engine.evaluate(&hot, true).len(), 1);
        assert_eq!(engine.toggle("missing"), None);
    }

    #[test]
    fn execution_log_is_bounded() {
        let mut engine = started(default_rules());
        let trigger = Trigger {
            rule_id: "emergency_protocol".to_string(),
            rule_name: "Emergency Protocol".to_string(),
            actions: vec![ActionCode::Fan, ActionCode::Light, ActionCode::Buzzer],
        };
        let snap = snapshot(Some(36.0), Some(90.0));

        for _ in 0..12 {
            engine.record_execution(&trigger, &snap, at());
        }

        assert_eq!(engine.execution_log().count(), 10);
        assert_eq!(
            engine.stats(),
            AutomationStats {
                rules_triggered: 12,
                actions_executed: 36,
            }
        );
    }

    #[test]
    fn rules_accept_camel_case_conditions() {
        let rule: Rule = serde_json::from_str(
            r#"{"id":"dry","name":"Dry","conditions":{"soilMoisture":{"max":30}},"actions":{"watering":true}}"#,
        )
        .unwrap();

        assert!(rule.enabled);
        assert_eq!(rule.conditions.soil_moisture, Some(Bound::at_most(30.0)));
        assert_eq!(rule.actions.codes(), vec![ActionCode::Water]);
    }
}
