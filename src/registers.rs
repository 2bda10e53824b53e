//! The register map of the Swegon CASA/SMART units: which input registers are read, and how each
//! of the snapshot fields is derived from them.
//!
//! Register addresses here are the 1-based register numbers used in the Swegon documentation. The
//! address actually transmitted over the wire is one less.

/// A contiguous run of input registers read with a single request.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    strum::IntoStaticStr,
    strum::Display,
    strum::VariantArray,
    serde::Serialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Block {
    Temperatures,
    UnitState,
    AirQuality,
    Fans,
    ModelName,
    Versions,
}

impl Block {
    pub const COUNT: usize = 6;

    /// The order in which the blocks are requested from the device during an acquisition.
    pub const READ_ORDER: [Block; Self::COUNT] = [
        Block::Temperatures,
        Block::UnitState,
        Block::AirQuality,
        Block::Fans,
        Block::ModelName,
        Block::Versions,
    ];

    pub const fn address(self) -> u16 {
        match self {
            Block::Temperatures => 6201,
            Block::UnitState => 6328,
            Block::AirQuality => 6212,
            Block::Fans => 6301,
            Block::ModelName => 6008,
            Block::Versions => 6001,
        }
    }

    pub const fn count(self) -> u16 {
        match self {
            Block::Temperatures => 11,
            Block::UnitState => 16,
            Block::AirQuality => 6,
            Block::Fans => 6,
            Block::ModelName => 17,
            Block::Versions => 7,
        }
    }

    const fn index(self) -> usize {
        self as usize
    }
}

/// The top-level groups of the snapshot.
///
/// These names end up in MQTT topics, so they must not contain `/` or whitespace.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    strum::IntoStaticStr,
    strum::Display,
    strum::VariantArray,
    serde::Serialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Temperatures,
    UnitState,
    AirQuality,
    Fans,
    Model,
}

/// A fixed list of state names, indexed by the raw register value.
#[derive(Debug, PartialEq, Eq)]
pub struct EnumTable {
    pub name: &'static str,
    pub states: &'static [&'static str],
}

pub static UNIT_STATES: EnumTable = EnumTable {
    name: "UnitState",
    states: &["External stop", "User stopped", "Starting", "Normal", "Commissioning"],
};

pub static VENTILATION_SPEED_STATES: EnumTable = EnumTable {
    name: "VentilationSpeedState",
    states: &["Stopped", "Away", "Home", "Boost", "Cooling"],
};

/// Heat exchanger bypass damper position. No field currently reads this.
pub static BYPASS_STATES: EnumTable = EnumTable {
    name: "BypassState",
    states: &["Closed (winter)", "Open (summer)"],
};

/// How the registers backing a field turn into a [`Value`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Rule {
    /// Two's complement 16-bit value in tenths (temperatures.)
    SignedTenths,
    /// Unsigned 16-bit value in tenths.
    UnsignedTenths,
    Raw,
    /// Unsigned value in tens (fan RPM.)
    RawTimesTen,
    Enum(&'static EnumTable),
    /// One character per register, NUL padded.
    Text,
    /// Dot-separated decimal components, one per register.
    Version,
}

impl std::fmt::Display for Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rule::SignedTenths => f.write_str("i16/10"),
            Rule::UnsignedTenths => f.write_str("u16/10"),
            Rule::Raw => f.write_str("u16"),
            Rule::RawTimesTen => f.write_str("u16*10"),
            Rule::Enum(table) => f.write_fmt(format_args!("enum {}", table.name)),
            Rule::Text => f.write_str("text"),
            Rule::Version => f.write_str("version"),
        }
    }
}

impl serde::Serialize for Rule {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// A single leaf of the snapshot and where it comes from.
#[derive(Clone, Copy, Debug)]
pub struct Field {
    pub category: Category,
    pub name: &'static str,
    pub block: Block,
    pub offset: u16,
    pub len: u16,
    pub rule: Rule,
}

impl Field {
    /// The 1-based number of the first register backing this field.
    pub const fn address(&self) -> u16 {
        self.block.address() + self.offset
    }

    pub fn words<'a>(&self, block: &'a RegisterBlock) -> &'a [u16] {
        let start = usize::from(self.offset);
        &block.words()[start..][..usize::from(self.len)]
    }
}

macro_rules! for_each_field {
    ($m:ident) => {
        $m! {
            Temperatures[0]: Temperatures, "fresh_air", SignedTenths;
            Temperatures[1]: Temperatures, "supply_air_before_reheater", SignedTenths;
            Temperatures[2]: Temperatures, "supply_air", SignedTenths;
            Temperatures[3]: Temperatures, "extract_air", SignedTenths;
            Temperatures[4]: Temperatures, "waste_air", SignedTenths;
            Temperatures[5]: Temperatures, "room", SignedTenths;
            Temperatures[6]: Temperatures, "user_panel", SignedTenths;
            Temperatures[7]: Temperatures, "user_panel_2", SignedTenths;
            Temperatures[8]: Temperatures, "water_radiator", SignedTenths;
            Temperatures[9]: Temperatures, "preheater", SignedTenths;
            Temperatures[10]: Temperatures, "external_fresh_air", SignedTenths;
            UnitState[0]: UnitState, "defrost_state", Raw;
            UnitState[1]: UnitState, "defrost_supply_forcing", Raw;
            UnitState[2]: UnitState, "defrost_exhaust_forcing", Raw;
            UnitState[5]: UnitState, "preheater_active", Raw;
            UnitState[6]: UnitState, "summer_cooling_active", Raw;
            UnitState[7]: UnitState, "fireplace_function_active", Raw;
            UnitState[8]: UnitState, "central_vacuum_cleaner_function_active", Raw;
            UnitState[9]: UnitState, "hood_compensation_active", Raw;
            UnitState[10]: UnitState, "external_boost_control_active", Raw;
            UnitState[11]: UnitState, "external_away_control_active", Raw;
            UnitState[12]: UnitState, "manual_heat_exchanger_bypass", Raw;
            UnitState[13]: UnitState, "automatic_heat_exchanger_bypass", Raw;
            UnitState[14]: UnitState, "filter_guard_input_status", Raw;
            UnitState[15]: UnitState, "hours_to_service", Raw;
            AirQuality[0]: AirQuality, "co2_unfiltered", Raw;
            AirQuality[1]: AirQuality, "co2_filtered", Raw;
            AirQuality[2]: AirQuality, "relative_humidity", Raw;
            AirQuality[3]: AirQuality, "absolute_humidity", UnsignedTenths;
            AirQuality[4]: AirQuality, "absolute_humidity_setpoint", UnsignedTenths;
            AirQuality[5]: AirQuality, "voc", Raw;
            Fans[0]: UnitState, "state", Enum(&UNIT_STATES);
            Fans[1]: UnitState, "ventilation_speed_state", Enum(&VENTILATION_SPEED_STATES);
            Fans[2]: Fans, "supply_fan_control", Raw;
            Fans[3]: Fans, "exhaust_fan_control", Raw;
            Fans[4]: Fans, "supply_fan_rpm", RawTimesTen;
            Fans[5]: Fans, "exhaust_fan_rpm", RawTimesTen;
            ModelName[0; 17]: Model, "name", Text;
            Versions[0; 3]: Model, "firmware_version", Version;
            Versions[3; 2]: Model, "parameter_version", Version;
            Versions[5; 2]: Model, "modbus_version", Version;
        }
    };
}

macro_rules! make_fields {
    ($(
        $block: ident [$offset: literal $(; $len: literal)?]:
        $category: ident, $name: literal, $rule: ident $(($table: expr))?;
    )+) => {
        pub static FIELDS: &[Field] = &[$(
            Field {
                category: Category::$category,
                name: $name,
                block: Block::$block,
                offset: $offset,
                len: field_len!($($len)?),
                rule: Rule::$rule $(($table))?,
            }
        ),*];
    };
}

macro_rules! field_len {
    () => {
        1
    };
    ($len: literal) => {
        $len
    };
}

for_each_field!(make_fields);

const _: () = {
    let mut idx = 0;
    while idx < FIELDS.len() {
        let field = &FIELDS[idx];
        assert!(field.len > 0, "fields must be backed by at least one register");
        assert!(
            field.offset + field.len <= field.block.count(),
            "field extends past the end of its register block"
        );
        idx += 1;
    }
};

/// Look up a field by its category and name.
pub fn field(category: Category, name: &str) -> Option<&'static Field> {
    FIELDS.iter().find(|f| f.category == category && f.name == name)
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[error("block `{block}` at {} must have {} registers, got {got}", .block.address(), .block.count())]
pub struct LengthMismatch {
    pub block: Block,
    pub got: usize,
}

/// Raw register words read for a [`Block`].
///
/// Always holds exactly [`Block::count`] words.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegisterBlock {
    block: Block,
    words: Vec<u16>,
}

impl RegisterBlock {
    pub fn new(block: Block, words: Vec<u16>) -> Result<Self, LengthMismatch> {
        if words.len() != usize::from(block.count()) {
            return Err(LengthMismatch { block, got: words.len() });
        }
        Ok(Self { block, words })
    }

    pub fn block(&self) -> Block {
        self.block
    }

    pub fn words(&self) -> &[u16] {
        &self.words
    }
}

/// The collection of blocks read during one acquisition.
#[derive(Clone, Debug, Default)]
pub struct RawBlocks {
    blocks: [Option<RegisterBlock>; Block::COUNT],
}

impl RawBlocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, block: RegisterBlock) {
        let index = block.block().index();
        self.blocks[index] = Some(block);
    }

    pub fn get(&self, block: Block) -> Option<&RegisterBlock> {
        self.blocks[block.index()].as_ref()
    }

    pub fn is_complete(&self) -> bool {
        self.blocks.iter().all(Option::is_some)
    }
}

/// A decoded field value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Integer(u32),
    Decimal(f64),
    Text(String),
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Integer(n) => f.write_fmt(format_args!("{}", n)),
            // `Debug` always keeps the fractional part (`25.0` rather than `25`.)
            Value::Decimal(n) => f.write_fmt(format_args!("{:?}", n)),
            Value::Text(s) => f.write_str(s),
        }
    }
}

impl serde::Serialize for Value {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Integer(n) => serializer.serialize_u32(*n),
            Value::Decimal(n) => serializer.serialize_f64(*n),
            Value::Text(s) => serializer.serialize_str(s),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::VariantArray as _;

    #[test]
    fn read_order_covers_every_block_once() {
        let mut order = Block::READ_ORDER.to_vec();
        order.sort();
        assert_eq!(order, Block::VARIANTS);
    }

    #[test]
    fn field_names_are_topic_safe_and_unique() {
        for (idx, field) in FIELDS.iter().enumerate() {
            assert!(!field.name.is_empty());
            assert!(
                field.name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_'),
                "{} is not topic-safe",
                field.name
            );
            let duplicate = FIELDS[idx + 1..]
                .iter()
                .any(|other| other.category == field.category && other.name == field.name);
            assert!(!duplicate, "{} is defined twice", field.name);
        }
    }

    #[test]
    fn category_field_counts() {
        let count = |c| FIELDS.iter().filter(|f| f.category == c).count();
        assert_eq!(count(Category::Temperatures), 11);
        assert_eq!(count(Category::UnitState), 16);
        assert_eq!(count(Category::AirQuality), 6);
        assert_eq!(count(Category::Fans), 4);
        assert_eq!(count(Category::Model), 4);
    }

    #[test]
    fn field_lookup_and_addresses() {
        let f = field(Category::UnitState, "hours_to_service").unwrap();
        assert_eq!(f.block, Block::UnitState);
        assert_eq!(f.address(), 6343);
        let f = field(Category::UnitState, "state").unwrap();
        assert_eq!(f.address(), 6301);
        assert_eq!(f.rule, Rule::Enum(&UNIT_STATES));
        let f = field(Category::Model, "modbus_version").unwrap();
        assert_eq!((f.offset, f.len), (5, 2));
        assert!(field(Category::Fans, "state").is_none());
    }

    #[test]
    fn register_block_length_is_enforced() {
        assert!(RegisterBlock::new(Block::Fans, vec![0; 6]).is_ok());
        assert_eq!(
            RegisterBlock::new(Block::Fans, vec![0; 5]),
            Err(LengthMismatch { block: Block::Fans, got: 5 })
        );
        assert!(RegisterBlock::new(Block::Fans, vec![0; 7]).is_err());
    }

    #[test]
    fn raw_blocks_completeness() {
        let mut blocks = RawBlocks::new();
        for block in &Block::READ_ORDER[..5] {
            blocks.insert(RegisterBlock::new(*block, vec![0; block.count().into()]).unwrap());
        }
        assert!(!blocks.is_complete());
        assert!(blocks.get(Block::Versions).is_none());
        blocks.insert(RegisterBlock::new(Block::Versions, vec![1; 7]).unwrap());
        assert!(blocks.is_complete());
        assert_eq!(blocks.get(Block::Versions).unwrap().words(), &[1; 7]);
    }

    #[test]
    fn value_display() {
        assert_eq!(Value::Decimal(25.0).to_string(), "25.0");
        assert_eq!(Value::Decimal(-3276.8).to_string(), "-3276.8");
        assert_eq!(Value::Integer(1230).to_string(), "1230");
        assert_eq!(Value::Text("1.2.3".into()).to_string(), "1.2.3");
        assert_eq!(BYPASS_STATES.states.len(), 2);
    }
}
