//! Typed boundary to the accessibility bus.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use deskvm_error::Result;

/// AT-SPI interface names.
pub mod interface {
    /// Base interface every accessible implements.
    pub const ACCESSIBLE: &str = "org.a11y.atspi.Accessible";
    /// Named actions (click, activate, ...).
    pub const ACTION: &str = "org.a11y.atspi.Action";
    /// Read access to text content.
    pub const TEXT: &str = "org.a11y.atspi.Text";
    /// Write access to text content.
    pub const EDITABLE_TEXT: &str = "org.a11y.atspi.EditableText";
    /// Geometry and focus.
    pub const COMPONENT: &str = "org.a11y.atspi.Component";
}

/// `AtspiRelationType` value of the "labelled by" relation.
pub const RELATION_LABELLED_BY: u32 = 2;

/// Address of one remote object: the unique bus name of its owner and its
/// object path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectRef {
    /// Unique bus name (`:1.42`).
    pub bus_name: String,
    /// Object path.
    pub path: String,
}

impl ObjectRef {
    /// Creates a new object reference.
    pub fn new(bus_name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            bus_name: bus_name.into(),
            path: path.into(),
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.bus_name, self.path)
    }
}

/// The calls the tree engine makes on the accessibility bus.
///
/// Implementations must report failures as
/// [`Error::Bus`](deskvm_error::Error::Bus) with a structured kind so that
/// callers never inspect error messages.
pub trait A11yBus: Send + Sync {
    /// Names currently owned on the bus.
    fn list_names(&self) -> Result<Vec<String>>;

    /// `Accessible.GetInterfaces`.
    fn interfaces(&self, obj: &ObjectRef) -> Result<Vec<String>>;

    /// String property of `interface`, read live.
    fn string_property(&self, obj: &ObjectRef, interface: &str, name: &str) -> Result<String>;

    /// Integer property of `interface`, read live.
    fn int_property(&self, obj: &ObjectRef, interface: &str, name: &str) -> Result<i32>;

    /// `Accessible.GetChildren`.
    fn children(&self, obj: &ObjectRef) -> Result<Vec<ObjectRef>>;

    /// `Accessible.GetRoleName`.
    fn role_name(&self, obj: &ObjectRef) -> Result<String>;

    /// `Accessible.GetRelationSet` as `(relation type, targets)` pairs.
    fn relation_set(&self, obj: &ObjectRef) -> Result<Vec<(u32, Vec<ObjectRef>)>>;

    /// `Accessible.GetState` bitmask words.
    fn state(&self, obj: &ObjectRef) -> Result<Vec<u32>>;

    /// `Action.GetName`.
    fn action_name(&self, obj: &ObjectRef, index: i32) -> Result<String>;

    /// `Action.DoAction`.
    fn do_action(&self, obj: &ObjectRef, index: i32) -> Result<bool>;

    /// `Component.GrabFocus`.
    fn grab_focus(&self, obj: &ObjectRef) -> Result<bool>;

    /// `Text.GetText`.
    fn text(&self, obj: &ObjectRef, start: i32, end: i32) -> Result<String>;

    /// `EditableText.SetTextContents`.
    fn set_text_contents(&self, obj: &ObjectRef, text: &str) -> Result<bool>;

    /// `EditableText.InsertText`.
    fn insert_text(&self, obj: &ObjectRef, position: i32, text: &str) -> Result<bool>;

    /// `EditableText.DeleteText`.
    fn delete_text(&self, obj: &ObjectRef, start: i32, end: i32) -> Result<bool>;
}

/// Opens a bus client on a host-local socket.
pub trait BusConnector: Send + Sync {
    /// Connects to the bus listening on `socket`.
    ///
    /// A socket that does not exist yet must be reported with
    /// [`BusErrorKind::NotFound`](deskvm_error::BusErrorKind::NotFound).
    fn connect(&self, socket: &Path) -> Result<Arc<dyn A11yBus>>;
}
