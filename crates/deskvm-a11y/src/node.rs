//! Accessible nodes and their capability views.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bitflags::bitflags;
use deskvm_error::{BusErrorKind, Error, Result};
use deskvm_retry::RetryPolicy;
use tracing::debug;

use crate::bus::{interface, A11yBus, ObjectRef, RELATION_LABELLED_BY};
use crate::state::{State, StateSet};

/// Budget for [`Accessible::set_text`] to see the new content land.
pub const SET_TEXT_TIMEOUT: Duration = Duration::from_secs(5);
/// Poll interval for [`Accessible::set_text`].
pub const SET_TEXT_INTERVAL: Duration = Duration::from_millis(200);

bitflags! {
    /// Optional interfaces a node reported when it was constructed.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Capabilities: u8 {
        /// `org.a11y.atspi.Action`
        const ACTION = 1 << 0;
        /// `org.a11y.atspi.Text`
        const TEXT = 1 << 1;
        /// `org.a11y.atspi.EditableText`
        const EDITABLE_TEXT = 1 << 2;
        /// `org.a11y.atspi.Component`
        const COMPONENT = 1 << 3;
    }
}

impl Capabilities {
    /// Builds the set from `GetInterfaces` output. Unknown interfaces are
    /// ignored.
    pub fn from_interfaces<I, S>(interfaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        interfaces
            .into_iter()
            .fold(Self::empty(), |caps, iface| match iface.as_ref() {
                interface::ACTION => caps | Self::ACTION,
                interface::TEXT => caps | Self::TEXT,
                interface::EDITABLE_TEXT => caps | Self::EDITABLE_TEXT,
                interface::COMPONENT => caps | Self::COMPONENT,
                _ => caps,
            })
    }
}

/// One element of a remote accessibility tree.
///
/// Cloning is cheap; clones share the bus connection.
#[derive(Clone)]
pub struct Accessible {
    bus: Arc<dyn A11yBus>,
    object: ObjectRef,
    capabilities: Capabilities,
    name: Option<String>,
    description: Option<String>,
    help_text: Option<String>,
}

impl Accessible {
    /// Binds to the object at `object`, observing its interfaces and
    /// snapshotting its name, description and help text.
    ///
    /// An object that does not answer `GetInterfaces` gets an empty
    /// capability set. Any other bus failure is returned.
    pub fn new(bus: Arc<dyn A11yBus>, object: ObjectRef) -> Result<Self> {
        let capabilities = match bus.interfaces(&object) {
            Ok(interfaces) => Capabilities::from_interfaces(interfaces),
            Err(e) if e.bus_kind() == Some(BusErrorKind::UnknownMethod) => Capabilities::empty(),
            Err(e) => return Err(e),
        };

        let name = optional_property(bus.as_ref(), &object, "Name")?;
        let description = optional_property(bus.as_ref(), &object, "Description")?;
        let help_text = optional_property(bus.as_ref(), &object, "HelpText")?;

        Ok(Self {
            bus,
            object,
            capabilities,
            name,
            description,
            help_text,
        })
    }

    /// The bus this node lives on.
    #[must_use]
    pub fn bus(&self) -> &Arc<dyn A11yBus> {
        &self.bus
    }

    /// Address of the remote object.
    #[must_use]
    pub fn object(&self) -> &ObjectRef {
        &self.object
    }

    /// Capabilities observed at construction.
    #[must_use]
    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    /// Accessible name at construction time.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Accessible description at construction time.
    #[must_use]
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Help text at construction time.
    #[must_use]
    pub fn help_text(&self) -> Option<&str> {
        self.help_text.as_deref()
    }

    /// Current children, in the order the remote side reports them.
    pub fn children(&self) -> Result<Vec<Self>> {
        self.bus
            .children(&self.object)?
            .into_iter()
            .map(|child| Self::new(Arc::clone(&self.bus), child))
            .collect()
    }

    /// Current role name (`push button`, `password text`, ...).
    pub fn role_name(&self) -> Result<String> {
        self.bus.role_name(&self.object)
    }

    /// Nodes this node is labelled by. Empty if there is no such relation.
    pub fn labels(&self) -> Result<Vec<Self>> {
        let relations = self.bus.relation_set(&self.object)?;
        match relations
            .into_iter()
            .find(|(kind, _)| *kind == RELATION_LABELLED_BY)
        {
            Some((_, targets)) => targets
                .into_iter()
                .map(|target| Self::new(Arc::clone(&self.bus), target))
                .collect(),
            None => Ok(Vec::new()),
        }
    }

    /// Current state flags.
    pub fn states(&self) -> Result<StateSet> {
        Ok(StateSet::from_words(&self.bus.state(&self.object)?))
    }

    /// Returns true if the node currently has keyboard focus.
    pub fn is_focused(&self) -> Result<bool> {
        Ok(self.states()?.contains(State::Focused))
    }

    /// Actions of the node. Empty if it has no `Action` interface.
    pub fn actions(&self) -> Result<Vec<Action>> {
        match self.as_action() {
            Some(actions) => actions.actions(),
            None => Ok(Vec::new()),
        }
    }

    /// Action view, if the node has the `Action` interface.
    #[must_use]
    pub fn as_action(&self) -> Option<ActionIface<'_>> {
        self.capabilities
            .contains(Capabilities::ACTION)
            .then_some(ActionIface { node: self })
    }

    /// Text view, if the node has the `Text` interface.
    #[must_use]
    pub fn as_text(&self) -> Option<TextIface<'_>> {
        self.capabilities
            .contains(Capabilities::TEXT)
            .then_some(TextIface { node: self })
    }

    /// Editable text view, if the node has the `EditableText` interface.
    #[must_use]
    pub fn as_editable_text(&self) -> Option<EditableTextIface<'_>> {
        self.capabilities
            .contains(Capabilities::EDITABLE_TEXT)
            .then_some(EditableTextIface { node: self })
    }

    /// Component view, if the node has the `Component` interface.
    #[must_use]
    pub fn as_component(&self) -> Option<ComponentIface<'_>> {
        self.capabilities
            .contains(Capabilities::COMPONENT)
            .then_some(ComponentIface { node: self })
    }

    /// Moves keyboard focus to this node.
    pub fn grab_focus(&self) -> Result<()> {
        self.require(self.as_component(), "Component")?.grab_focus()
    }

    /// Invokes the `click` action.
    pub fn click(&self) -> Result<()> {
        self.do_action_named("click")
    }

    /// Invokes the `activate` action.
    pub fn activate(&self) -> Result<()> {
        self.do_action_named("activate")
    }

    /// Invokes the first action called `name`.
    ///
    /// Action names are resolved on every call.
    pub fn do_action_named(&self, name: &str) -> Result<()> {
        for action in self.actions()? {
            if action.name()? == name {
                return action.invoke();
            }
        }
        Err(Error::not_found(format!("action '{name}' for {self}")))
    }

    /// Number of characters in the text content.
    pub fn character_count(&self) -> Result<i32> {
        self.require(self.as_text(), "Text")?.character_count()
    }

    /// Text between `start` (default 0) and `end` (default the character
    /// count).
    pub fn get_text(&self, start: Option<i32>, end: Option<i32>) -> Result<String> {
        let text = self.require(self.as_text(), "Text")?;
        let end = match end {
            Some(end) => end,
            None => text.character_count()?,
        };
        text.text(start.unwrap_or(0), end)
    }

    /// Replaces the text content, waiting until the new length is visible.
    ///
    /// The character count is the only check: password entries render their
    /// content as bullets, so reading the text back proves nothing.
    pub fn set_text(&self, text: &str) -> Result<()> {
        let policy = RetryPolicy::new(SET_TEXT_TIMEOUT, SET_TEXT_INTERVAL);
        self.set_text_with(text, &policy)
    }

    /// [`set_text`](Self::set_text) under a caller-supplied policy.
    pub fn set_text_with(&self, text: &str, policy: &RetryPolicy) -> Result<()> {
        let editable = self.require(self.as_editable_text(), "EditableText")?;
        let reader = self.require(self.as_text(), "Text")?;
        let expected = text.chars().count();
        let policy = policy
            .clone()
            .with_message(format!("Failed to set text for {self}"));

        policy.run(|| {
            if !editable.set_contents(text)? {
                return Err(Error::remote(format!("could not set text for {self}")));
            }
            let count = reader.character_count()?;
            if usize::try_from(count).ok() != Some(expected) {
                return Err(Error::retriable(format!(
                    "character count is {count}, expected {expected}"
                )));
            }
            Ok(())
        })
    }

    /// Inserts `text` at `position`.
    pub fn insert_text(&self, text: &str, position: i32) -> Result<()> {
        self.require(self.as_editable_text(), "EditableText")?
            .insert(position, text)
    }

    /// Deletes text between `start` and `end` (default the character count).
    pub fn delete_text(&self, start: i32, end: Option<i32>) -> Result<()> {
        let editable = self.require(self.as_editable_text(), "EditableText")?;
        let end = match end {
            Some(end) => end,
            None => self.character_count()?,
        };
        editable.delete(start, end)
    }

    /// One-line diagnostic dump of the live node. Missing text is left blank.
    pub fn describe(&self) -> Result<String> {
        let labels: Vec<String> = self.labels()?.iter().map(|l| quoted(l.name())).collect();
        Ok(format!(
            "(name={}, role_name={:?}, description={}, labels=[{}], states={}, bus_name={:?}, path={:?})",
            quoted(self.name()),
            self.role_name()?,
            quoted(self.description()),
            labels.join(", "),
            self.states()?,
            self.object.bus_name,
            self.object.path,
        ))
    }

    fn require<T>(&self, view: Option<T>, capability: &'static str) -> Result<T> {
        view.ok_or_else(|| Error::MissingCapability {
            capability,
            node: self.to_string(),
        })
    }
}

impl fmt::Display for Accessible {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "(name={}, description={}, bus_name={:?}, path={:?})",
            quoted(self.name()),
            quoted(self.description()),
            self.object.bus_name,
            self.object.path
        )
    }
}

fn quoted(text: Option<&str>) -> String {
    text.map(|text| format!("{text:?}")).unwrap_or_default()
}

impl fmt::Debug for Accessible {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Accessible")
            .field("object", &self.object)
            .field("capabilities", &self.capabilities)
            .field("name", &self.name)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

fn optional_property(bus: &dyn A11yBus, object: &ObjectRef, name: &str) -> Result<Option<String>> {
    match bus.string_property(object, interface::ACCESSIBLE, name) {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.bus_kind().is_some_and(BusErrorKind::is_unsupported) => Ok(None),
        Err(e) => Err(e),
    }
}

/// One action of a node, identified by its index.
#[derive(Clone)]
pub struct Action {
    bus: Arc<dyn A11yBus>,
    object: ObjectRef,
    index: i32,
}

impl Action {
    /// Index into the owning node's action list.
    #[must_use]
    pub fn index(&self) -> i32 {
        self.index
    }

    /// Current name of the action.
    pub fn name(&self) -> Result<String> {
        self.bus.action_name(&self.object, self.index)
    }

    /// Performs the action.
    pub fn invoke(&self) -> Result<()> {
        debug!(object = %self.object, index = self.index, "Invoking action");
        if self.bus.do_action(&self.object, self.index)? {
            Ok(())
        } else {
            Err(Error::remote(format!(
                "action {} of {} was not performed",
                self.index, self.object
            )))
        }
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Action")
            .field("object", &self.object)
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}

/// `Action` interface of a node.
pub struct ActionIface<'a> {
    node: &'a Accessible,
}

impl ActionIface<'_> {
    /// Number of actions, read live.
    pub fn count(&self) -> Result<i32> {
        self.node
            .bus
            .int_property(&self.node.object, interface::ACTION, "NActions")
    }

    /// All actions.
    pub fn actions(&self) -> Result<Vec<Action>> {
        Ok((0..self.count()?)
            .map(|index| Action {
                bus: Arc::clone(&self.node.bus),
                object: self.node.object.clone(),
                index,
            })
            .collect())
    }
}

/// `Text` interface of a node.
pub struct TextIface<'a> {
    node: &'a Accessible,
}

impl TextIface<'_> {
    /// Number of characters, read live.
    pub fn character_count(&self) -> Result<i32> {
        self.node
            .bus
            .int_property(&self.node.object, interface::TEXT, "CharacterCount")
    }

    /// Text between two character offsets.
    pub fn text(&self, start: i32, end: i32) -> Result<String> {
        self.node.bus.text(&self.node.object, start, end)
    }
}

/// `EditableText` interface of a node.
pub struct EditableTextIface<'a> {
    node: &'a Accessible,
}

impl EditableTextIface<'_> {
    /// Replaces the whole content. Returns what the remote side reported.
    pub fn set_contents(&self, text: &str) -> Result<bool> {
        self.node.bus.set_text_contents(&self.node.object, text)
    }

    /// Inserts `text` at `position`.
    pub fn insert(&self, position: i32, text: &str) -> Result<()> {
        if self.node.bus.insert_text(&self.node.object, position, text)? {
            Ok(())
        } else {
            Err(Error::remote(format!("could not insert text for {}", self.node)))
        }
    }

    /// Deletes the characters between `start` and `end`.
    pub fn delete(&self, start: i32, end: i32) -> Result<()> {
        if self.node.bus.delete_text(&self.node.object, start, end)? {
            Ok(())
        } else {
            Err(Error::remote(format!("could not delete text for {}", self.node)))
        }
    }
}

/// `Component` interface of a node.
pub struct ComponentIface<'a> {
    node: &'a Accessible,
}

impl ComponentIface<'_> {
    /// Moves keyboard focus to the node.
    pub fn grab_focus(&self) -> Result<()> {
        if self.node.bus.grab_focus(&self.node.object)? {
            Ok(())
        } else {
            Err(Error::remote(format!("could not grab focus for {}", self.node)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeBus, FakeNode};

    fn entry_tree() -> (Arc<FakeBus>, Accessible) {
        let bus = FakeBus::new();
        bus.insert(
            FakeNode::new(":1.5", "/root")
                .name("gnome-shell")
                .role("application")
                .child("/entry")
                .child("/label"),
        );
        bus.insert(
            FakeNode::new(":1.5", "/entry")
                .role("password text")
                .interfaces(&[
                    interface::ACCESSIBLE,
                    interface::TEXT,
                    interface::EDITABLE_TEXT,
                    interface::ACTION,
                    interface::COMPONENT,
                ])
                .labelled_by("/label")
                .states(&[State::Editable, State::Focusable])
                .action("activate"),
        );
        bus.insert(FakeNode::new(":1.5", "/label").name("Password").role("label"));
        let root = bus.node("/root");
        (bus, root)
    }

    #[test]
    fn test_capabilities_from_interfaces() {
        let caps = Capabilities::from_interfaces([
            interface::ACCESSIBLE,
            interface::TEXT,
            "org.a11y.atspi.Hyperlink",
        ]);
        assert_eq!(caps, Capabilities::TEXT);
    }

    #[test]
    fn test_snapshot_and_live_queries() {
        let (bus, root) = entry_tree();
        assert_eq!(root.name(), Some("gnome-shell"));
        assert_eq!(root.role_name().unwrap(), "application");

        let children = root.children().unwrap();
        assert_eq!(children.len(), 2);
        let entry = &children[0];
        assert_eq!(entry.role_name().unwrap(), "password text");
        assert!(entry.states().unwrap().contains(State::Editable));

        // Role changes are visible on the next query.
        bus.update("/entry", |n| n.role = "text".into());
        assert_eq!(entry.role_name().unwrap(), "text");
    }

    #[test]
    fn test_labels() {
        let (bus, _) = entry_tree();
        let entry = bus.node("/entry");
        let labels = entry.labels().unwrap();
        assert_eq!(labels.len(), 1);
        assert_eq!(labels[0].name(), Some("Password"));

        let label = bus.node("/label");
        assert!(label.labels().unwrap().is_empty());
    }

    #[test]
    fn test_unknown_method_degrades_to_no_capabilities() {
        let bus = FakeBus::new();
        bus.insert(FakeNode::new(":1.9", "/obj").no_interfaces());
        let node = bus.node("/obj");
        assert!(node.capabilities().is_empty());
        assert_eq!(node.name(), None);
        assert!(node.actions().unwrap().is_empty());
    }

    #[test]
    fn test_missing_capability_is_fatal() {
        let (bus, _) = entry_tree();
        let label = bus.node("/label");
        let err = label.grab_focus().unwrap_err();
        assert!(matches!(
            err,
            Error::MissingCapability {
                capability: "Component",
                ..
            }
        ));
        assert!(label.as_text().is_none());
        assert!(label.set_text("x").is_err());
    }

    #[test]
    fn test_grab_focus() {
        let (bus, _) = entry_tree();
        let entry = bus.node("/entry");
        entry.grab_focus().unwrap();
        assert!(entry.is_focused().unwrap());
    }

    #[test]
    fn test_grab_focus_refused() {
        let (bus, _) = entry_tree();
        bus.update("/entry", |n| n.refuse_focus = true);
        let entry = bus.node("/entry");
        assert!(matches!(entry.grab_focus().unwrap_err(), Error::Remote(_)));
    }

    #[test]
    fn test_activate_and_missing_action() {
        let (bus, _) = entry_tree();
        let entry = bus.node("/entry");
        entry.activate().unwrap();
        assert_eq!(bus.performed(), vec![("/entry".to_string(), "activate".to_string())]);

        let err = entry.click().unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_text_round_trip_operations() {
        let (bus, _) = entry_tree();
        let entry = bus.node("/entry");
        entry.set_text("ubuntu").unwrap();
        assert_eq!(entry.character_count().unwrap(), 6);
        assert_eq!(entry.get_text(None, None).unwrap(), "ubuntu");

        entry.insert_text("my-", 0).unwrap();
        assert_eq!(entry.get_text(None, None).unwrap(), "my-ubuntu");
        assert_eq!(entry.get_text(Some(3), Some(5)).unwrap(), "ub");

        entry.delete_text(0, Some(3)).unwrap();
        assert_eq!(entry.get_text(None, None).unwrap(), "ubuntu");

        entry.delete_text(0, None).unwrap();
        assert_eq!(entry.character_count().unwrap(), 0);
    }

    #[test]
    fn test_set_text_times_out_when_count_never_matches() {
        let (bus, _) = entry_tree();
        bus.update("/entry", |n| n.stuck_character_count = Some(4));
        let entry = bus.node("/entry");

        let policy = RetryPolicy::new(Duration::from_millis(100), Duration::from_millis(10));
        let err = entry.set_text_with("secret", &policy).unwrap_err();
        assert!(err.is_timeout(), "unexpected error: {err}");
        assert!(!err.to_string().contains("secret"));
    }

    #[test]
    fn test_set_text_rejected_is_fatal() {
        let (bus, _) = entry_tree();
        bus.update("/entry", |n| n.read_only = true);
        let entry = bus.node("/entry");

        let policy = RetryPolicy::new(Duration::from_secs(5), Duration::from_millis(10));
        let err = entry.set_text_with("secret", &policy).unwrap_err();
        assert!(matches!(err, Error::Remote(_)));
    }

    #[test]
    fn test_describe() {
        let (bus, _) = entry_tree();
        let entry = bus.node("/entry");
        let text = entry.describe().unwrap();
        assert!(text.contains("role_name=\"password text\""));
        assert!(text.contains("labels=[\"Password\"]"));
        assert!(text.contains("description=,"));
        assert!(!text.contains("Some("));
        assert!(text.contains("editable"));
    }
}
