use crate::registers::{Category, Value};

/// One group of decoded fields, kept in register map order.
#[derive(Clone, Debug, PartialEq)]
pub struct Section {
    fields: Vec<(&'static str, Value)>,
}

impl Section {
    pub(crate) fn new(fields: Vec<(&'static str, Value)>) -> Self {
        Self { fields }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.iter().find(|(n, _)| *n == name).map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &Value)> + '_ {
        self.fields.iter().map(|(n, v)| (*n, v))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl serde::Serialize for Section {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_map(self.iter())
    }
}

/// Complete decoded state of the unit from a single acquisition.
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct DeviceSnapshot {
    pub temperatures: Section,
    pub unit_state: Section,
    pub air_quality: Section,
    pub fans: Section,
    pub model: Section,
}

/// A single MQTT message derived from a snapshot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: String,
}

impl DeviceSnapshot {
    pub fn section(&self, category: Category) -> &Section {
        match category {
            Category::Temperatures => &self.temperatures,
            Category::UnitState => &self.unit_state,
            Category::AirQuality => &self.air_quality,
            Category::Fans => &self.fans,
            Category::Model => &self.model,
        }
    }

    /// All the leaves as `(category, field, value)`.
    pub fn entries(&self) -> impl Iterator<Item = (Category, &'static str, &Value)> + '_ {
        use strum::VariantArray as _;
        Category::VARIANTS.iter().flat_map(move |&category| {
            self.section(category).iter().map(move |(name, value)| (category, name, value))
        })
    }

    /// Flatten into `{prefix}/{category}/{field}` messages.
    pub fn messages(&self, prefix: &str) -> Vec<Message> {
        let prefix = prefix.trim_end_matches('/');
        self.entries()
            .map(|(category, name, value)| Message {
                topic: format!("{prefix}/{category}/{name}"),
                payload: value.to_string(),
            })
            .collect()
    }

    /// Render as JSON with keys sorted and three-space indentation.
    pub fn to_pretty_json(&self) -> Result<String, serde_json::Error> {
        use serde::Serialize as _;
        // `serde_json::Map` is ordered by key unless `preserve_order` is enabled.
        let value = serde_json::to_value(self)?;
        let mut buffer = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"   ");
        let mut serializer = serde_json::Serializer::with_formatter(&mut buffer, formatter);
        value.serialize(&mut serializer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}
