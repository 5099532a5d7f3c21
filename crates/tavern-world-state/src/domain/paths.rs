//! Enum-driven resolution of dotted state paths.
//!
//! Generation services address state with strings like
//! `gameState.角色.法利`, `character.hp` or `inventory[2].quantity`. A path is
//! parsed once into a [`StatePath`]; everything downstream matches on the
//! enum instead of walking a JSON tree.

use std::fmt;

use serde_json::Value;
use tavern_core::error::DomainError;
use tavern_core::sheet::SheetId;

use super::state::{Account, PlayerCharacter};

/// A field of the player character.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CharacterField {
    Name,
    Level,
    Currency,
    Hp,
    MaxHp,
    Mind,
    MaxMind,
    Stamina,
    MaxStamina,
    MaxCarry,
    Strength,
    Endurance,
    Dexterity,
    Agility,
    Magic,
}

impl CharacterField {
    fn parse(segment: &str) -> Option<Self> {
        let field = match segment {
            "name" | "姓名" => Self::Name,
            "level" | "等级" => Self::Level,
            "currency" | "valis" | "法利" => Self::Currency,
            "hp" | "生命值" => Self::Hp,
            "max_hp" | "maxHp" | "最大生命值" => Self::MaxHp,
            "mind" | "精神力" => Self::Mind,
            "max_mind" | "maxMind" | "最大精神力" => Self::MaxMind,
            "stamina" | "体力" => Self::Stamina,
            "max_stamina" | "maxStamina" | "最大体力" => Self::MaxStamina,
            "max_carry" | "maxCarry" | "最大负重" => Self::MaxCarry,
            "strength" | "力量" => Self::Strength,
            "endurance" | "耐久" => Self::Endurance,
            "dexterity" | "灵巧" => Self::Dexterity,
            "agility" | "敏捷" => Self::Agility,
            "magic" | "魔力" => Self::Magic,
            _ => return None,
        };
        Some(field)
    }

    /// Canonical field name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Name => "name",
            Self::Level => "level",
            Self::Currency => "currency",
            Self::Hp => "hp",
            Self::MaxHp => "max_hp",
            Self::Mind => "mind",
            Self::MaxMind => "max_mind",
            Self::Stamina => "stamina",
            Self::MaxStamina => "max_stamina",
            Self::MaxCarry => "max_carry",
            Self::Strength => "strength",
            Self::Endurance => "endurance",
            Self::Dexterity => "dexterity",
            Self::Agility => "agility",
            Self::Magic => "magic",
        }
    }

    /// Whether the field is recomputed after every batch and therefore
    /// not writable.
    #[must_use]
    pub fn is_derived(self) -> bool {
        matches!(
            self,
            Self::MaxHp | Self::MaxMind | Self::MaxStamina | Self::MaxCarry
        )
    }

    fn is_ability(self) -> bool {
        matches!(
            self,
            Self::Strength | Self::Endurance | Self::Dexterity | Self::Agility | Self::Magic
        )
    }

    /// Reads the field as JSON.
    #[must_use]
    pub fn read(self, character: &PlayerCharacter) -> Value {
        match self {
            Self::Name => Value::String(character.name.clone()),
            Self::Level => Value::from(character.level),
            _ => Value::from(*self.number_ref(character)),
        }
    }

    /// Writes the field from JSON.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` for derived fields and for values
    /// of the wrong type.
    pub fn write(self, character: &mut PlayerCharacter, value: &Value) -> Result<(), DomainError> {
        if self.is_derived() {
            return Err(DomainError::Validation(format!(
                "character.{} is derived and read-only",
                self.as_str()
            )));
        }
        match self {
            Self::Name => {
                character.name = value
                    .as_str()
                    .ok_or_else(|| type_error(self, "a string"))?
                    .to_owned();
            }
            Self::Level => {
                let level = value
                    .as_u64()
                    .and_then(|n| u32::try_from(n).ok())
                    .filter(|n| *n >= 1)
                    .ok_or_else(|| type_error(self, "a positive integer"))?;
                character.level = level;
            }
            _ => {
                let number = as_number(value).ok_or_else(|| type_error(self, "a number"))?;
                *self.number_mut(character) = number;
            }
        }
        Ok(())
    }

    /// Mutable access to a numeric field; `None` for name and level.
    pub fn number_field(self, character: &mut PlayerCharacter) -> Option<&mut f64> {
        match self {
            Self::Name | Self::Level => None,
            _ => Some(self.number_mut(character)),
        }
    }

    fn number_ref(self, c: &PlayerCharacter) -> &f64 {
        match self {
            Self::Currency => &c.currency,
            Self::Hp => &c.hp,
            Self::MaxHp => &c.max_hp,
            Self::Mind => &c.mind,
            Self::MaxMind => &c.max_mind,
            Self::Stamina => &c.stamina,
            Self::MaxStamina => &c.max_stamina,
            Self::MaxCarry => &c.max_carry,
            Self::Strength => &c.abilities.strength,
            Self::Endurance => &c.abilities.endurance,
            Self::Dexterity => &c.abilities.dexterity,
            Self::Agility => &c.abilities.agility,
            Self::Magic | Self::Name | Self::Level => &c.abilities.magic,
        }
    }

    fn number_mut(self, c: &mut PlayerCharacter) -> &mut f64 {
        match self {
            Self::Currency => &mut c.currency,
            Self::Hp => &mut c.hp,
            Self::MaxHp => &mut c.max_hp,
            Self::Mind => &mut c.mind,
            Self::MaxMind => &mut c.max_mind,
            Self::Stamina => &mut c.stamina,
            Self::MaxStamina => &mut c.max_stamina,
            Self::MaxCarry => &mut c.max_carry,
            Self::Strength => &mut c.abilities.strength,
            Self::Endurance => &mut c.abilities.endurance,
            Self::Dexterity => &mut c.abilities.dexterity,
            Self::Agility => &mut c.abilities.agility,
            Self::Magic | Self::Name | Self::Level => &mut c.abilities.magic,
        }
    }
}

fn type_error(field: CharacterField, expected: &str) -> DomainError {
    DomainError::Validation(format!("character.{} expects {expected}", field.as_str()))
}

/// Reads a finite JSON number, accepting numeric strings. `NaN` and
/// infinities are refused.
#[must_use]
pub fn as_number(value: &Value) -> Option<f64> {
    let number = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    number.filter(|n| n.is_finite())
}

/// A field of the familia.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FamiliaField {
    Name,
    Funds,
}

impl FamiliaField {
    fn parse(segment: &str) -> Option<Self> {
        match segment {
            "name" | "名称" => Some(Self::Name),
            "funds" | "资金" => Some(Self::Funds),
            _ => None,
        }
    }

    /// Canonical field name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Name => "name",
            Self::Funds => "funds",
        }
    }
}

/// A keyed collection reachable by path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Collection {
    Inventory,
    Registry,
    Interactions,
    News,
    Rumors,
    PhoneMessages,
    CombatEncounter,
    CombatLog,
}

impl Collection {
    /// Canonical dotted name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Inventory => "inventory",
            Self::Registry => "registry",
            Self::Interactions => "interactions",
            Self::News => "world.news",
            Self::Rumors => "world.rumors",
            Self::PhoneMessages => "phone.messages",
            Self::CombatEncounter => "combat.encounter",
            Self::CombatLog => "combat.log",
        }
    }

    /// Sheet backing the collection.
    #[must_use]
    pub fn sheet(self) -> SheetId {
        match self {
            Self::Inventory => SheetId::ItemInventory,
            Self::Registry => SheetId::NpcRegistry,
            Self::Interactions => SheetId::NpcInteractionLog,
            Self::News => SheetId::WorldNews,
            Self::Rumors => SheetId::WorldRumors,
            Self::PhoneMessages => SheetId::PhoneMessages,
            Self::CombatEncounter => SheetId::CombatEncounter,
            Self::CombatLog => SheetId::GlobalState,
        }
    }
}

/// How an entry inside a collection is addressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowSelector {
    /// Position in insertion order.
    Index(usize),
    /// Row key.
    Key(String),
}

/// A resolved state path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatePath {
    GameTime,
    Location,
    Weather,
    Character(CharacterField),
    Familia(FamiliaField),
    CombatActive,
    Collection(Collection),
    Entry {
        collection: Collection,
        row: RowSelector,
        field: Option<String>,
    },
}

fn segments(raw: &str) -> Vec<String> {
    let trimmed = raw.trim();
    let body = trimmed.strip_prefix("gameState").unwrap_or(trimmed);
    body.replace('[', ".")
        .replace(']', "")
        .split('.')
        .map(|s| s.trim().trim_matches(|c| c == '\'' || c == '"').to_owned())
        .filter(|s| !s.is_empty())
        .collect()
}

impl StatePath {
    /// Parses a dotted or bracketed path.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::UnknownPath` when the path does not address a
    /// known location.
    pub fn parse(raw: &str) -> Result<Self, DomainError> {
        let unknown = || DomainError::UnknownPath(raw.to_owned());
        let parts = segments(raw);
        let mut iter = parts.iter().map(String::as_str);
        let root = iter.next().ok_or_else(unknown)?;
        let rest: Vec<&str> = iter.collect();

        let path = match root {
            "game_time" | "gameTime" | "游戏时间" if rest.is_empty() => Self::GameTime,
            "location" | "当前地点" if rest.is_empty() => Self::Location,
            "weather" | "天气" if rest.is_empty() => Self::Weather,
            "character" | "player" | "角色" => match rest.as_slice() {
                [field] => Self::Character(CharacterField::parse(field).ok_or_else(unknown)?),
                ["abilities" | "能力值", field] => {
                    let field = CharacterField::parse(field).ok_or_else(unknown)?;
                    if !field.is_ability() {
                        return Err(unknown());
                    }
                    Self::Character(field)
                }
                _ => return Err(unknown()),
            },
            "familia" | "眷族" => match rest.as_slice() {
                [field] => Self::Familia(FamiliaField::parse(field).ok_or_else(unknown)?),
                _ => return Err(unknown()),
            },
            "inventory" | "背包" => Self::collection(Collection::Inventory, &rest),
            "registry" | "npcs" | "confidants" | "社交" => {
                Self::collection(Collection::Registry, &rest)
            }
            "interactions" => Self::collection(Collection::Interactions, &rest),
            "world" | "世界" => match rest.split_first() {
                Some((&("news" | "头条新闻"), tail)) => Self::collection(Collection::News, tail),
                Some((&("rumors" | "街头传闻"), tail)) => Self::collection(Collection::Rumors, tail),
                _ => return Err(unknown()),
            },
            "phone" | "手机" => match rest.split_first() {
                Some((&("messages" | "消息"), tail)) => {
                    Self::collection(Collection::PhoneMessages, tail)
                }
                _ => return Err(unknown()),
            },
            "combat" | "战斗" => match rest.split_first() {
                Some((&("active" | "是否战斗中"), [])) => Self::CombatActive,
                Some((&("encounter" | "敌方"), tail)) => {
                    Self::collection(Collection::CombatEncounter, tail)
                }
                Some((&("log" | "战斗日志"), tail)) => Self::collection(Collection::CombatLog, tail),
                _ => return Err(unknown()),
            },
            _ => return Err(unknown()),
        };
        Ok(path)
    }

    fn collection(collection: Collection, rest: &[&str]) -> Self {
        match rest.split_first() {
            None => Self::Collection(collection),
            Some((row, tail)) => {
                let row = row
                    .parse::<usize>()
                    .map_or_else(|_| RowSelector::Key((*row).to_owned()), RowSelector::Index);
                let field = (!tail.is_empty()).then(|| tail.join("."));
                Self::Entry {
                    collection,
                    row,
                    field,
                }
            }
        }
    }

    /// Sheet the path writes into.
    #[must_use]
    pub fn sheet(&self) -> SheetId {
        match self {
            Self::GameTime | Self::Location | Self::Weather | Self::CombatActive => {
                SheetId::GlobalState
            }
            Self::Character(_) | Self::Familia(_) => SheetId::CharacterResources,
            Self::Collection(c) | Self::Entry { collection: c, .. } => c.sheet(),
        }
    }

    /// Sheet column the path writes, as seen by scope checks.
    #[must_use]
    pub fn field(&self) -> Option<String> {
        match self {
            Self::GameTime => Some("game_time".to_owned()),
            Self::Location => Some("location".to_owned()),
            Self::Weather => Some("weather".to_owned()),
            Self::CombatActive => Some("combat_active".to_owned()),
            Self::Character(field) => Some(field.as_str().to_owned()),
            Self::Familia(FamiliaField::Funds) => Some("familia_funds".to_owned()),
            Self::Familia(FamiliaField::Name) => Some("familia_name".to_owned()),
            Self::Collection(_) => None,
            Self::Entry { field, .. } => field.clone(),
        }
    }

    /// Currency account the path addresses, if any.
    #[must_use]
    pub fn account(&self) -> Option<Account> {
        match self {
            Self::Character(CharacterField::Currency) => Some(Account::CharacterCurrency),
            Self::Familia(FamiliaField::Funds) => Some(Account::FamiliaFunds),
            _ => None,
        }
    }

    /// Whether a write here must be re-validated against invariants.
    #[must_use]
    pub fn is_invariant_sensitive(&self) -> bool {
        match self {
            Self::Character(field) => !matches!(field, CharacterField::Name),
            Self::Familia(FamiliaField::Funds) => true,
            Self::Entry {
                collection: Collection::Registry,
                field,
                ..
            } => field
                .as_deref()
                .is_none_or(|f| matches!(f, "affinity" | "hp" | "max_hp")),
            Self::Collection(Collection::Registry) => true,
            _ => false,
        }
    }
}

impl fmt::Display for StatePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GameTime => f.write_str("game_time"),
            Self::Location => f.write_str("location"),
            Self::Weather => f.write_str("weather"),
            Self::CombatActive => f.write_str("combat.active"),
            Self::Character(field) => write!(f, "character.{}", field.as_str()),
            Self::Familia(field) => write!(f, "familia.{}", field.as_str()),
            Self::Collection(c) => f.write_str(c.as_str()),
            Self::Entry {
                collection,
                row,
                field,
            } => {
                match row {
                    RowSelector::Index(i) => write!(f, "{}[{i}]", collection.as_str())?,
                    RowSelector::Key(k) => write!(f, "{}.{k}", collection.as_str())?,
                }
                if let Some(field) = field {
                    write!(f, ".{field}")?;
                }
                Ok(())
            }
        }
    }
}
