// Status Module - Printer event rules: persisted mapping <-> editable list
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::sync::{Arc, RwLock};

/// Brightness given to freshly added rules and used when a rule leaves it unset
pub const DEFAULT_BRIGHTNESS: u8 = 255;

/// Printer lifecycle events a rule can be attached to
pub const AVAILABLE_EVENTS: &[&str] = &[
    "Startup",
    "Shutdown",
    "Connecting",
    "Connected",
    "Disconnecting",
    "Disconnected",
    "Error",
    "PrinterStateChanged",
    "PrintStarted",
    "PrintFailed",
    "PrintDone",
    "PrintCancelling",
    "PrintCancelled",
    "PrintPaused",
    "PrintResumed",
    "FileSelected",
    "FileDeselected",
    "MetadataAnalysisStarted",
    "MetadataAnalysisFinished",
    "SlicingStarted",
    "SlicingDone",
    "SlicingFailed",
    "Home",
    "ZChange",
    "Dwell",
    "Waiting",
    "Cooling",
    "Alert",
    "EStop",
    "FilamentChange",
    "CaptureStart",
    "CaptureDone",
    "MovieRendering",
    "MovieDone",
    "MovieFailed",
];

pub type RuleId = u64;

// Loosely typed scalar, settings written by older panels store "" for unset numbers
#[derive(Deserialize)]
#[serde(untagged)]
enum Loose {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

fn lenient_u8<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u8>, D::Error> {
    Ok(lenient_u64(d)?.map(|v| v.min(u8::MAX as u64) as u8))
}

fn lenient_u64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u64>, D::Error> {
    let value = Option::<Loose>::deserialize(d)?;
    Ok(match value {
        Some(Loose::Int(n)) if n >= 0 => Some(n as u64),
        Some(Loose::Float(f)) if f >= 0.0 => Some(f.round() as u64),
        Some(Loose::Text(s)) => s.trim().parse::<u64>().ok(),
        _ => None,
    })
}

fn lenient_bool<'de, D: Deserializer<'de>>(d: D) -> Result<Option<bool>, D::Error> {
    let value = Option::<Loose>::deserialize(d)?;
    Ok(match value {
        Some(Loose::Bool(b)) => Some(b),
        Some(Loose::Int(n)) => Some(n != 0),
        Some(Loose::Float(f)) => Some(f != 0.0),
        Some(Loose::Text(s)) => Some(matches!(s.trim().to_lowercase().as_str(), "true" | "1" | "yes" | "on")),
        None => None,
    })
}

fn lenient_flag<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
    Ok(lenient_bool(d)?.unwrap_or(false))
}

/// Light parameters stored for one event
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRecord {
    #[serde(default)]
    pub colour: String,
    #[serde(default, deserialize_with = "lenient_u8", skip_serializing_if = "Option::is_none")]
    pub brightness: Option<u8>,
    #[serde(default, deserialize_with = "lenient_u64", skip_serializing_if = "Option::is_none")]
    pub delay: Option<u64>,
    #[serde(default, deserialize_with = "lenient_bool", skip_serializing_if = "Option::is_none")]
    pub turnoff: Option<bool>,
}

impl StatusRecord {
    /// Brightness to send to the lamp; unset and zero fall back to the configured default
    pub fn effective_brightness(&self, default_bri: u8) -> u8 {
        match self.brightness {
            Some(b) if b > 0 => b,
            _ => default_bri,
        }
    }

    pub fn effective_delay(&self) -> u64 {
        self.delay.unwrap_or(0)
    }

    /// Records saved before `turnoff` existed always switched the light off
    pub fn switches_off(&self) -> bool {
        self.turnoff.unwrap_or(true)
    }
}

/// Persisted form: event name -> record, keeping insertion order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusMap {
    entries: Vec<(String, StatusRecord)>,
}

impl StatusMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, event: &str) -> Option<&StatusRecord> {
        self.entries.iter().find(|(k, _)| k == event).map(|(_, v)| v)
    }

    /// Insert or overwrite; an existing key keeps its position
    pub fn insert(&mut self, event: String, record: StatusRecord) -> Option<StatusRecord> {
        if let Some((_, existing)) = self.entries.iter_mut().find(|(k, _)| *k == event) {
            return Some(std::mem::replace(existing, record));
        }
        self.entries.push((event, record));
        None
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &StatusRecord)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn events(&self) -> Vec<String> {
        self.entries.iter().map(|(k, _)| k.clone()).collect()
    }
}

impl FromIterator<(String, StatusRecord)> for StatusMap {
    fn from_iter<I: IntoIterator<Item = (String, StatusRecord)>>(iter: I) -> Self {
        let mut map = StatusMap::new();
        for (event, record) in iter {
            map.insert(event, record);
        }
        map
    }
}

impl Serialize for StatusMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (event, record) in &self.entries {
            map.serialize_entry(event, record)?;
        }
        map.end()
    }
}

struct StatusMapVisitor;

impl<'de> Visitor<'de> for StatusMapVisitor {
    type Value = StatusMap;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a table of event names to light settings")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<StatusMap, A::Error> {
        let mut map = StatusMap::new();
        while let Some((event, record)) = access.next_entry::<String, StatusRecord>()? {
            map.insert(event, record);
        }
        Ok(map)
    }
}

impl<'de> Deserialize<'de> for StatusMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_map(StatusMapVisitor)
    }
}

/// Read access to a rule field, whether stored plainly or in an observable cell
pub trait Readable<T> {
    fn get(&self) -> T;
}

macro_rules! plain_readable {
    ($($t:ty),*) => {
        $(impl Readable<$t> for $t {
            fn get(&self) -> $t {
                self.clone()
            }
        })*
    };
}

plain_readable!(String, Option<u8>, Option<u64>, bool);

/// Shared mutable cell for rules bound to an open editing session
#[derive(Debug, Default)]
pub struct Observable<T> {
    inner: Arc<RwLock<T>>,
}

impl<T> Clone for Observable<T> {
    fn clone(&self) -> Self {
        Observable { inner: Arc::clone(&self.inner) }
    }
}

impl<T: Clone> Observable<T> {
    pub fn new(value: T) -> Self {
        Observable { inner: Arc::new(RwLock::new(value)) }
    }

    pub fn set(&self, value: T) {
        match self.inner.write() {
            Ok(mut guard) => *guard = value,
            Err(poisoned) => *poisoned.into_inner() = value,
        }
    }

    pub fn update(&self, f: impl FnOnce(&mut T)) {
        match self.inner.write() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }
}

impl<T: Clone> Readable<T> for Observable<T> {
    fn get(&self) -> T {
        match self.inner.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

/// Field view shared by plain and bound rules, all `collapse` needs
pub trait RuleFields {
    fn event(&self) -> &dyn Readable<String>;
    fn colour(&self) -> &dyn Readable<String>;
    fn brightness(&self) -> &dyn Readable<Option<u8>>;
    fn delay(&self) -> &dyn Readable<Option<u64>>;
    fn turnoff(&self) -> &dyn Readable<bool>;

    fn record(&self) -> StatusRecord {
        StatusRecord {
            colour: self.colour().get(),
            brightness: self.brightness().get(),
            delay: self.delay().get(),
            turnoff: Some(self.turnoff().get()),
        }
    }
}

/// Editable form of one rule
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRule {
    #[serde(default)]
    pub id: RuleId,
    #[serde(default)]
    pub event: String,
    #[serde(default)]
    pub colour: String,
    #[serde(default, deserialize_with = "lenient_u8")]
    pub brightness: Option<u8>,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub delay: Option<u64>,
    #[serde(default, deserialize_with = "lenient_flag")]
    pub turnoff: bool,
}

impl RuleFields for StatusRule {
    fn event(&self) -> &dyn Readable<String> {
        &self.event
    }
    fn colour(&self) -> &dyn Readable<String> {
        &self.colour
    }
    fn brightness(&self) -> &dyn Readable<Option<u8>> {
        &self.brightness
    }
    fn delay(&self) -> &dyn Readable<Option<u64>> {
        &self.delay
    }
    fn turnoff(&self) -> &dyn Readable<bool> {
        &self.turnoff
    }
}

/// Rule whose fields live in observable cells, edited field by field
#[derive(Debug, Clone)]
pub struct BoundRule {
    pub id: RuleId,
    pub event: Observable<String>,
    pub colour: Observable<String>,
    pub brightness: Observable<Option<u8>>,
    pub delay: Observable<Option<u64>>,
    pub turnoff: Observable<bool>,
}

impl BoundRule {
    pub fn bind(rule: &StatusRule) -> Self {
        BoundRule {
            id: rule.id,
            event: Observable::new(rule.event.clone()),
            colour: Observable::new(rule.colour.clone()),
            brightness: Observable::new(rule.brightness),
            delay: Observable::new(rule.delay),
            turnoff: Observable::new(rule.turnoff),
        }
    }

    pub fn snapshot(&self) -> StatusRule {
        StatusRule {
            id: self.id,
            event: self.event.get(),
            colour: self.colour.get(),
            brightness: self.brightness.get(),
            delay: self.delay.get(),
            turnoff: self.turnoff.get(),
        }
    }

    /// Set a single field from a JSON value sent by the panel
    pub fn set_field(&self, field: &str, value: &serde_json::Value) -> Result<(), String> {
        match field {
            "event" => value.as_str().map(|v| self.event.set(v.trim().to_string())).ok_or_else(|| "Invalid value".to_string()),
            "colour" => value.as_str().map(|v| self.colour.set(v.trim().to_string())).ok_or_else(|| "Invalid value".to_string()),
            "brightness" => {
                let parsed = lenient_u8(value.clone()).map_err(|e| e.to_string())?;
                self.brightness.set(parsed);
                Ok(())
            }
            "delay" => {
                let parsed = lenient_u64(value.clone()).map_err(|e| e.to_string())?;
                self.delay.set(parsed);
                Ok(())
            }
            "turnoff" => {
                let parsed = lenient_flag(value.clone()).map_err(|e| e.to_string())?;
                self.turnoff.set(parsed);
                Ok(())
            }
            _ => Err(format!("Unknown field: {}", field)),
        }
    }
}

impl RuleFields for BoundRule {
    fn event(&self) -> &dyn Readable<String> {
        &self.event
    }
    fn colour(&self) -> &dyn Readable<String> {
        &self.colour
    }
    fn brightness(&self) -> &dyn Readable<Option<u8>> {
        &self.brightness
    }
    fn delay(&self) -> &dyn Readable<Option<u64>> {
        &self.delay
    }
    fn turnoff(&self) -> &dyn Readable<bool> {
        &self.turnoff
    }
}

/// Rules that can live in a `RuleList`
pub trait EditableRule: RuleFields {
    fn id(&self) -> RuleId;
    fn blank(id: RuleId) -> Self;
    fn toggle_turnoff(&mut self);
}

impl EditableRule for StatusRule {
    fn id(&self) -> RuleId {
        self.id
    }

    fn blank(id: RuleId) -> Self {
        StatusRule {
            id,
            event: String::new(),
            colour: String::new(),
            brightness: Some(DEFAULT_BRIGHTNESS),
            delay: Some(0),
            turnoff: false,
        }
    }

    fn toggle_turnoff(&mut self) {
        self.turnoff = !self.turnoff;
    }
}

impl EditableRule for BoundRule {
    fn id(&self) -> RuleId {
        self.id
    }

    fn blank(id: RuleId) -> Self {
        BoundRule::bind(&StatusRule::blank(id))
    }

    fn toggle_turnoff(&mut self) {
        self.turnoff.update(|t| *t = !*t);
    }
}

/// Expand the persisted mapping into editable rules, in map order
pub fn expand(map: &StatusMap) -> Vec<StatusRule> {
    map.iter()
        .enumerate()
        .map(|(i, (event, record))| StatusRule {
            id: i as RuleId + 1,
            event: event.to_string(),
            colour: record.colour.clone(),
            brightness: record.brightness,
            delay: record.delay,
            turnoff: record.switches_off(),
        })
        .collect()
}

/// Collapse editable rules back into the persisted mapping.
/// Later rules win on duplicate events; rules with a blank event are dropped.
pub fn collapse<'a, R, I>(rules: I) -> StatusMap
where
    R: RuleFields + 'a,
    I: IntoIterator<Item = &'a R>,
{
    let mut map = StatusMap::new();
    for rule in rules {
        let event = rule.event().get();
        if event.trim().is_empty() {
            log::warn!("Dropping status rule with no event name");
            continue;
        }
        map.insert(event, rule.record());
    }
    map
}

/// Flip a rule's auto-off flag
pub fn toggle_turnoff<R: EditableRule>(rule: &mut R) {
    rule.toggle_turnoff();
}

/// Ordered editable rule list with stable rule identities
#[derive(Debug, Clone)]
pub struct RuleList<R> {
    rules: Vec<R>,
    next_id: RuleId,
}

impl<R: EditableRule> RuleList<R> {
    pub fn new(rules: Vec<R>) -> Self {
        let next_id = rules.iter().map(|r| r.id()).max().unwrap_or(0) + 1;
        RuleList { rules, next_id }
    }

    #[cfg(test)]
    pub fn rules(&self) -> &[R] {
        &self.rules
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn get(&self, id: RuleId) -> Option<&R> {
        self.rules.iter().find(|r| r.id() == id)
    }

    pub fn get_mut(&mut self, id: RuleId) -> Option<&mut R> {
        self.rules.iter_mut().find(|r| r.id() == id)
    }

    /// Append a blank rule (brightness 255, delay 0, auto-off unset); no validation
    pub fn add_default_rule(&mut self) -> RuleId {
        let id = self.next_id;
        self.next_id += 1;
        self.rules.push(R::blank(id));
        id
    }

    /// Remove the first rule with this identity; false if there is none
    pub fn remove_rule(&mut self, id: RuleId) -> bool {
        match self.rules.iter().position(|r| r.id() == id) {
            Some(index) => {
                self.rules.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn toggle_turnoff(&mut self, id: RuleId) -> Option<bool> {
        let rule = self.get_mut(id)?;
        toggle_turnoff(rule);
        Some(rule.turnoff().get())
    }

    pub fn collapse(&self) -> StatusMap {
        collapse(self.rules.iter())
    }
}

#[cfg(test)]
impl RuleList<StatusRule> {
    pub fn from_map(map: &StatusMap) -> Self {
        RuleList::new(expand(map))
    }
}

impl RuleList<BoundRule> {
    pub fn bound_from_map(map: &StatusMap) -> Self {
        RuleList::new(expand(map).iter().map(BoundRule::bind).collect())
    }

    pub fn snapshot(&self) -> Vec<StatusRule> {
        self.rules.iter().map(BoundRule::snapshot).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(colour: &str, brightness: u8, delay: u64, turnoff: Option<bool>) -> StatusRecord {
        StatusRecord {
            colour: colour.to_string(),
            brightness: Some(brightness),
            delay: Some(delay),
            turnoff,
        }
    }

    fn sample_map() -> StatusMap {
        let mut map = StatusMap::new();
        map.insert("PrintStarted".to_string(), record("#FFFFFF", 255, 0, Some(false)));
        map.insert("PrintDone".to_string(), record("#33FF36", 200, 5, Some(false)));
        map.insert("Disconnected".to_string(), record("", 255, 0, Some(true)));
        map
    }

    #[test]
    fn test_expand_yields_one_rule_per_event_in_order() {
        let map = sample_map();
        let rules = expand(&map);
        assert_eq!(rules.len(), map.len());
        let events: Vec<&str> = rules.iter().map(|r| r.event.as_str()).collect();
        assert_eq!(events, vec!["PrintStarted", "PrintDone", "Disconnected"]);
        assert_eq!(rules[1].colour, "#33FF36");
        assert_eq!(rules[1].brightness, Some(200));
        assert_eq!(rules[1].delay, Some(5));
    }

    #[test]
    fn test_expand_empty_map() {
        assert!(expand(&StatusMap::new()).is_empty());
    }

    #[test]
    fn test_round_trip_is_exact_when_turnoff_present() {
        let map = sample_map();
        let rules = expand(&map);
        assert_eq!(collapse(rules.iter()), map);
    }

    #[test]
    fn test_missing_turnoff_expands_to_true() {
        let mut map = StatusMap::new();
        map.insert("PrintFailed".to_string(), record("#FF0000", 255, 0, None));
        let rules = expand(&map);
        assert!(rules[0].turnoff);

        let collapsed = collapse(rules.iter());
        assert_eq!(collapsed.get("PrintFailed").and_then(|r| r.turnoff), Some(true));
    }

    #[test]
    fn test_collapse_last_write_wins() {
        let first = StatusRule {
            id: 1,
            event: "PrintDone".to_string(),
            colour: "#00FF00".to_string(),
            brightness: Some(100),
            delay: Some(0),
            turnoff: false,
        };
        let other = StatusRule { id: 2, event: "PrintStarted".to_string(), ..first.clone() };
        let second = StatusRule {
            id: 3,
            event: "PrintDone".to_string(),
            colour: "#0000FF".to_string(),
            brightness: Some(50),
            delay: Some(10),
            turnoff: true,
        };
        let map = collapse([first, other, second.clone()].iter());
        assert_eq!(map.len(), 2);
        assert_eq!(map.get("PrintDone"), Some(&second.record()));
        // Overwritten key stays where it was first inserted
        assert_eq!(map.events(), vec!["PrintDone", "PrintStarted"]);
    }

    #[test]
    fn test_collapse_drops_blank_events() {
        let mut list: RuleList<StatusRule> = RuleList::from_map(&sample_map());
        list.add_default_rule();
        let id = list.add_default_rule();
        if let Some(rule) = list.get_mut(id) {
            rule.event = "   ".to_string();
        }
        let map = list.collapse();
        assert_eq!(map, sample_map());
    }

    #[test]
    fn test_collapse_keeps_event_names_verbatim() {
        let mut map = StatusMap::new();
        map.insert(" PrintDone".to_string(), record("#33FF36", 200, 5, Some(false)));
        map.insert("PrintFailed ".to_string(), record("#FF0000", 255, 0, Some(true)));

        let collapsed = collapse(expand(&map).iter());
        assert_eq!(collapsed, map);
        assert!(collapsed.get("PrintDone").is_none());
    }

    #[test]
    fn test_add_default_rule() {
        let mut list: RuleList<StatusRule> = RuleList::new(Vec::new());
        list.add_default_rule();
        assert_eq!(list.len(), 1);
        let rule = &list.rules()[0];
        assert_eq!(rule.brightness, Some(255));
        assert_eq!(rule.delay, Some(0));
        assert_eq!(rule.event, "");
        assert_eq!(rule.colour, "");
        assert!(!rule.turnoff);
    }

    #[test]
    fn test_remove_rule_by_identity() {
        let mut list = RuleList::from_map(&sample_map());
        let target = list.rules()[1].id;
        assert!(list.remove_rule(target));
        assert_eq!(list.len(), 2);
        assert!(list.get(target).is_none());
        // Already gone
        assert!(!list.remove_rule(target));
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn test_remove_rule_only_removes_identical_rule() {
        let mut list: RuleList<StatusRule> = RuleList::new(Vec::new());
        let a = list.add_default_rule();
        let b = list.add_default_rule();
        assert!(list.remove_rule(b));
        assert_eq!(list.rules()[0].id, a);
    }

    #[test]
    fn test_toggle_turnoff() {
        let mut rule = StatusRule::blank(1);
        toggle_turnoff(&mut rule);
        assert!(rule.turnoff);
        toggle_turnoff(&mut rule);
        assert!(!rule.turnoff);
    }

    #[test]
    fn test_bound_rules_collapse_through_observables() {
        let mut list = RuleList::bound_from_map(&sample_map());
        let id = list.rules()[0].id;
        let rule = list.get(id).unwrap();
        rule.colour.set("#123456".to_string());
        rule.set_field("brightness", &serde_json::json!("")).unwrap();
        assert_eq!(list.toggle_turnoff(id), Some(true));

        let map = list.collapse();
        let started = map.get("PrintStarted").unwrap();
        assert_eq!(started.colour, "#123456");
        assert_eq!(started.brightness, None);
        assert_eq!(started.turnoff, Some(true));
        assert_eq!(map.get("PrintDone"), sample_map().get("PrintDone"));
    }

    #[test]
    fn test_bound_rule_rejects_unknown_field() {
        let rule = BoundRule::blank(1);
        assert!(rule.set_field("lamp", &serde_json::json!(1)).is_err());
        assert!(rule.set_field("event", &serde_json::json!(5)).is_err());
    }

    #[test]
    fn test_map_json_keeps_order_and_legacy_values() {
        let json = r##"{
            "PrintDone": {"colour": "#33FF36", "brightness": 255, "delay": 0, "turnoff": false},
            "Disconnected": {"colour": "", "brightness": "", "delay": 0, "turnoff": true},
            "Connected": {"colour": "#FFFFFF", "brightness": "128", "delay": ""}
        }"##;
        let map: StatusMap = serde_json::from_str(json).unwrap();
        assert_eq!(map.events(), vec!["PrintDone", "Disconnected", "Connected"]);
        assert_eq!(map.get("Disconnected").unwrap().brightness, None);
        let connected = map.get("Connected").unwrap();
        assert_eq!(connected.brightness, Some(128));
        assert_eq!(connected.delay, None);
        assert_eq!(connected.turnoff, None);
        assert!(connected.switches_off());
    }

    #[test]
    fn test_effective_values_fall_back_on_falsy() {
        let rec = StatusRecord { colour: String::new(), brightness: Some(0), delay: None, turnoff: None };
        assert_eq!(rec.effective_brightness(180), 180);
        assert_eq!(rec.effective_delay(), 0);
        let rec = StatusRecord { brightness: Some(42), ..rec };
        assert_eq!(rec.effective_brightness(180), 42);
    }
}
