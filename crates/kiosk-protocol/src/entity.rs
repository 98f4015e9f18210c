//! Synchronizable entities: the catalog and order records both sides share.
//!
//! Every type here is a plain value: equality and hashing cover the full
//! content, and the serde derives are the entity's codec. Five kinds live
//! in registries (see [`EntityKind`]); the rest ([`Cart`], [`OrderItem`],
//! [`SelectedOption`], [`OrderStatus`]) only appear nested inside them.

use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

/// A single choice inside an [`OptionGroup`] ("extra shot", "no ice").
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MenuOption {
    pub id: String,
    pub name: String,
    /// Price added on top of the menu price, in the smallest currency unit.
    pub extra_cost: i64,
}

/// A named set of options, e.g. "Temperature: hot / cold".
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OptionGroup {
    pub id: String,
    pub name: String,
    /// Whether the customer must pick one option from this group.
    pub required: bool,
    pub options: Vec<MenuOption>,
}

/// A sellable item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Menu {
    pub id: String,
    pub name: String,
    pub price: i64,
    pub category_id: String,
    pub image_path: String,
    pub description: String,
    pub option_groups: Vec<OptionGroup>,
}

/// A category and the menus it lists, in display order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Category {
    pub id: String,
    pub name: String,
    pub menus: Vec<Menu>,
}

impl Category {
    /// Returns a copy without the menu `menu_id`, or `None` if the category
    /// never listed it.
    pub fn without_menu(&self, menu_id: &str) -> Option<Category> {
        if !self.menus.iter().any(|m| m.id == menu_id) {
            return None;
        }
        Some(Category {
            id: self.id.clone(),
            name: self.name.clone(),
            menus: self
                .menus
                .iter()
                .filter(|m| m.id != menu_id)
                .cloned()
                .collect(),
        })
    }
}

// ---------------------------------------------------------------------------
// Orders
// ---------------------------------------------------------------------------

/// Lifecycle of an order. Serialized lowercase (`"pending"`, ...).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    /// Submitted by a kiosk, not yet seen by the server.
    #[default]
    Pending,
    Accepted,
    Canceled,
    Unknown,
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Canceled => "canceled",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// One option the customer picked, remembered with the group it came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SelectedOption {
    pub group_id: String,
    pub option: MenuOption,
}

/// A line in a cart: a menu, the chosen options, and a quantity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderItem {
    pub menu: Menu,
    pub selected_options: Vec<SelectedOption>,
    pub quantity: u32,
}

impl OrderItem {
    /// `(menu price + Σ option extra cost) × quantity`.
    pub fn total_price(&self) -> i64 {
        let options: i64 = self
            .selected_options
            .iter()
            .map(|s| s.option.extra_cost)
            .sum();
        (self.menu.price + options) * i64::from(self.quantity)
    }

    /// Human-readable line, e.g. `Latte (Temperature: Hot, Shot: Extra)`.
    pub fn description(&self) -> String {
        if self.selected_options.is_empty() {
            return self.menu.name.clone();
        }
        let picked: Vec<String> = self
            .selected_options
            .iter()
            .map(|s| {
                let group = self
                    .menu
                    .option_groups
                    .iter()
                    .find(|g| g.id == s.group_id)
                    .map_or(s.group_id.as_str(), |g| g.name.as_str());
                format!("{group}: {}", s.option.name)
            })
            .collect();
        format!("{} ({})", self.menu.name, picked.join(", "))
    }
}

/// The items of one order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct Cart {
    pub items: Vec<OrderItem>,
}

impl Cart {
    /// Sum of every line's total price.
    pub fn total(&self) -> i64 {
        self.items.iter().map(OrderItem::total_price).sum()
    }
}

/// A customer order.
///
/// `order_id` is assigned by the server. A kiosk submits a fresh checkout
/// with `order_id <= 0` and learns the real id from the `OrderUpdated`
/// reply.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Order {
    pub order_id: i64,
    pub customer: String,
    /// Milliseconds since the Unix epoch.
    pub order_time: u64,
    pub status: OrderStatus,
    pub cart: Cart,
}

impl Order {
    /// A checkout that has not been assigned an id yet.
    pub fn checkout(customer: impl Into<String>, order_time: u64, cart: Cart) -> Self {
        Self {
            order_id: 0,
            customer: customer.into(),
            order_time,
            status: OrderStatus::Pending,
            cart,
        }
    }

    /// Returns `true` until the server has assigned an id.
    pub fn is_unassigned(&self) -> bool {
        self.order_id <= 0
    }

    /// Returns a copy with a different status.
    pub fn with_status(&self, status: OrderStatus) -> Self {
        Self {
            status,
            ..self.clone()
        }
    }
}

// ---------------------------------------------------------------------------
// Registry-stored entities
// ---------------------------------------------------------------------------

/// The declared type of a registry-stored entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Order,
    Menu,
    Category,
    #[serde(rename = "option")]
    MenuOption,
    OptionGroup,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Order => "order",
            Self::Menu => "menu",
            Self::Category => "category",
            Self::MenuOption => "option",
            Self::OptionGroup => "option_group",
        };
        f.write_str(s)
    }
}

/// Any entity that can travel inside `ResponseData` / `DataAdded`.
///
/// Adjacently tagged so the receiver knows the declared type before it
/// looks at the body:
/// `{ "kind": "menu", "value": { "id": "latte", ... } }`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Entity {
    Order(Order),
    Menu(Menu),
    Category(Category),
    #[serde(rename = "option")]
    MenuOption(MenuOption),
    OptionGroup(OptionGroup),
}

impl Entity {
    /// The declared type of this entity.
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Order(_) => EntityKind::Order,
            Self::Menu(_) => EntityKind::Menu,
            Self::Category(_) => EntityKind::Category,
            Self::MenuOption(_) => EntityKind::MenuOption,
            Self::OptionGroup(_) => EntityKind::OptionGroup,
        }
    }

    /// The registry element id of the wrapped entity.
    pub fn element_id(&self) -> String {
        match self {
            Self::Order(e) => e.element_id(),
            Self::Menu(e) => e.element_id(),
            Self::Category(e) => e.element_id(),
            Self::MenuOption(e) => e.element_id(),
            Self::OptionGroup(e) => e.element_id(),
        }
    }
}

/// Links a concrete entity type to its [`EntityKind`] and element id.
///
/// Registries are generic over this trait; the `Entity` conversions let a
/// typed registry accept values that arrived type-erased off the wire.
pub trait SyncEntity:
    Clone + Eq + std::hash::Hash + fmt::Debug + Send + Sync + 'static
{
    /// The declared type stored in registries of this entity.
    const KIND: EntityKind;

    /// Stable id, unique within the entity's registry.
    fn element_id(&self) -> String;

    /// Wraps this value for the wire.
    fn into_entity(self) -> Entity;

    /// Unwraps a wire value, handing it back unchanged on kind mismatch.
    fn try_from_entity(entity: Entity) -> Result<Self, Entity>;
}

macro_rules! sync_entity {
    ($ty:ident, $variant:ident, |$this:ident| $id:expr) => {
        impl SyncEntity for $ty {
            const KIND: EntityKind = EntityKind::$variant;

            fn element_id(&self) -> String {
                let $this = self;
                $id
            }

            fn into_entity(self) -> Entity {
                Entity::$variant(self)
            }

            fn try_from_entity(entity: Entity) -> Result<Self, Entity> {
                match entity {
                    Entity::$variant(value) => Ok(value),
                    other => Err(other),
                }
            }
        }

        impl From<$ty> for Entity {
            fn from(value: $ty) -> Self {
                Entity::$variant(value)
            }
        }
    };
}

sync_entity!(Order, Order, |o| o.order_id.to_string());
sync_entity!(Menu, Menu, |m| m.id.clone());
sync_entity!(Category, Category, |c| c.id.clone());
sync_entity!(MenuOption, MenuOption, |o| o.id.clone());
sync_entity!(OptionGroup, OptionGroup, |g| g.id.clone());

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn shot() -> MenuOption {
        MenuOption {
            id: "shot_1".into(),
            name: "Extra shot".into(),
            extra_cost: 500,
        }
    }

    pub fn shot_group() -> OptionGroup {
        OptionGroup {
            id: "shot".into(),
            name: "Shot".into(),
            required: false,
            options: vec![
                MenuOption {
                    id: "shot_default".into(),
                    name: "Default".into(),
                    extra_cost: 0,
                },
                shot(),
            ],
        }
    }

    pub fn latte() -> Menu {
        Menu {
            id: "latte".into(),
            name: "Latte".into(),
            price: 4500,
            category_id: "coffee".into(),
            image_path: "images/latte.png".into(),
            description: "Espresso with steamed milk".into(),
            option_groups: vec![shot_group()],
        }
    }

    pub fn coffee() -> Category {
        Category {
            id: "coffee".into(),
            name: "Coffee".into(),
            menus: vec![latte()],
        }
    }

    pub fn order(order_id: i64, status: OrderStatus) -> Order {
        Order {
            order_id,
            customer: "kiosk-1".into(),
            order_time: 1_700_000_000_000,
            status,
            cart: Cart {
                items: vec![OrderItem {
                    menu: latte(),
                    selected_options: vec![SelectedOption {
                        group_id: "shot".into(),
                        option: shot(),
                    }],
                    quantity: 2,
                }],
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    fn round_trip<T>(value: &T) -> T
    where
        T: Serialize + serde::de::DeserializeOwned,
    {
        let bytes = serde_json::to_vec(value).unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_each_registry_entity_round_trips() {
        let order = order(7, OrderStatus::Accepted);
        assert_eq!(round_trip(&order), order);
        assert_eq!(round_trip(&latte()), latte());
        assert_eq!(round_trip(&coffee()), coffee());
        assert_eq!(round_trip(&shot()), shot());
        assert_eq!(round_trip(&shot_group()), shot_group());
    }

    #[test]
    fn test_entity_is_adjacently_tagged() {
        let json = serde_json::to_value(Entity::from(shot())).unwrap();
        assert_eq!(json["kind"], "option");
        assert_eq!(json["value"]["id"], "shot_1");
        assert_eq!(json["value"]["extra_cost"], 500);
    }

    #[test]
    fn test_entity_round_trip_keeps_kind() {
        let entity = Entity::from(order(3, OrderStatus::Pending));
        let decoded: Entity = round_trip(&entity);
        assert_eq!(decoded.kind(), EntityKind::Order);
        assert_eq!(decoded, entity);
    }

    #[test]
    fn test_order_status_serializes_lowercase() {
        let json = serde_json::to_string(&OrderStatus::Canceled).unwrap();
        assert_eq!(json, "\"canceled\"");
    }

    #[test]
    fn test_order_element_id_is_decimal_order_id() {
        assert_eq!(order(42, OrderStatus::Pending).element_id(), "42");
        assert_eq!(Entity::from(order(42, OrderStatus::Pending)).element_id(), "42");
    }

    #[test]
    fn test_try_from_entity_hands_back_mismatch() {
        let entity = Entity::from(latte());
        let back = Order::try_from_entity(entity.clone()).unwrap_err();
        assert_eq!(back, entity);
        assert_eq!(Menu::try_from_entity(entity).unwrap(), latte());
    }

    #[test]
    fn test_cart_total_includes_option_costs() {
        // (4500 + 500) × 2
        assert_eq!(order(1, OrderStatus::Pending).cart.total(), 10_000);
    }

    #[test]
    fn test_order_item_description_names_groups() {
        let item = &order(1, OrderStatus::Pending).cart.items[0];
        assert_eq!(item.description(), "Latte (Shot: Extra shot)");
    }

    #[test]
    fn test_checkout_is_unassigned_and_pending() {
        let o = Order::checkout("kiosk-9", 5, Cart::default());
        assert!(o.is_unassigned());
        assert_eq!(o.status, OrderStatus::Pending);
        assert_eq!(o.with_status(OrderStatus::Accepted).status, OrderStatus::Accepted);
    }

    #[test]
    fn test_category_without_menu() {
        assert!(coffee().without_menu("mocha").is_none());
        let stripped = coffee().without_menu("latte").unwrap();
        assert!(stripped.menus.is_empty());
        assert_eq!(stripped.id, "coffee");
    }
}
