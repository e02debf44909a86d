//! In-memory accessibility bus for tests.
//!
//! [`FakeBus`] holds a widget tree keyed by object address and answers the
//! [`A11yBus`] calls from it. Nodes can be edited between calls to simulate
//! a GUI that changes under the test.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use deskvm_error::{BusError, BusErrorKind, Error, Result};

use crate::bus::{interface, A11yBus, ObjectRef, RELATION_LABELLED_BY};
use crate::node::Accessible;
use crate::state::State;

/// One widget of a [`FakeBus`].
#[derive(Debug, Clone)]
pub struct FakeNode {
    /// Address of the widget.
    pub object: ObjectRef,
    /// `Name` property. `None` answers with an unknown-property error.
    pub name: Option<String>,
    /// `Description` property.
    pub description: Option<String>,
    /// `HelpText` property.
    pub help_text: Option<String>,
    /// Role name.
    pub role: String,
    /// Reported interfaces. `None` answers `GetInterfaces` with an
    /// unknown-method error.
    pub interfaces: Option<Vec<String>>,
    /// Paths of the children, on the same bus name.
    pub children: Vec<String>,
    /// Paths of the labelling widgets, on the same bus name.
    pub labelled_by: Vec<String>,
    /// Current states.
    pub states: Vec<State>,
    /// Action names.
    pub actions: Vec<String>,
    /// Text content.
    pub text: String,
    /// Reported character count regardless of content.
    pub stuck_character_count: Option<i32>,
    /// `SetTextContents` and friends report failure.
    pub read_only: bool,
    /// `GrabFocus` reports failure.
    pub refuse_focus: bool,
}

impl FakeNode {
    /// A widget implementing only the base interface.
    pub fn new(bus_name: &str, path: &str) -> Self {
        Self {
            object: ObjectRef::new(bus_name, path),
            name: None,
            description: None,
            help_text: None,
            role: "unknown".into(),
            interfaces: Some(vec![interface::ACCESSIBLE.into()]),
            children: Vec::new(),
            labelled_by: Vec::new(),
            states: Vec::new(),
            actions: Vec::new(),
            text: String::new(),
            stuck_character_count: None,
            read_only: false,
            refuse_focus: false,
        }
    }

    #[must_use]
    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn description(mut self, description: &str) -> Self {
        self.description = Some(description.into());
        self
    }

    #[must_use]
    pub fn role(mut self, role: &str) -> Self {
        self.role = role.into();
        self
    }

    #[must_use]
    pub fn interfaces(mut self, interfaces: &[&str]) -> Self {
        self.interfaces = Some(interfaces.iter().map(|i| (*i).to_string()).collect());
        self
    }

    /// Makes `GetInterfaces` unknown on this widget.
    #[must_use]
    pub fn no_interfaces(mut self) -> Self {
        self.interfaces = None;
        self
    }

    #[must_use]
    pub fn child(mut self, path: &str) -> Self {
        self.children.push(path.into());
        self
    }

    #[must_use]
    pub fn labelled_by(mut self, path: &str) -> Self {
        self.labelled_by.push(path.into());
        self
    }

    #[must_use]
    pub fn states(mut self, states: &[State]) -> Self {
        self.states = states.to_vec();
        self
    }

    #[must_use]
    pub fn action(mut self, name: &str) -> Self {
        self.actions.push(name.into());
        self
    }

    #[must_use]
    pub fn text(mut self, text: &str) -> Self {
        self.text = text.into();
        self
    }

    fn has(&self, iface: &str) -> bool {
        self.interfaces
            .as_ref()
            .is_some_and(|ifaces| ifaces.iter().any(|i| i == iface))
    }

    fn require(&self, iface: &str) -> Result<()> {
        if self.has(iface) {
            Ok(())
        } else {
            Err(bus_error(
                BusErrorKind::UnknownInterface,
                format!("{} does not implement {iface}", self.object),
            ))
        }
    }

    fn sibling(&self, path: &str) -> ObjectRef {
        ObjectRef::new(self.object.bus_name.clone(), path)
    }
}

/// An accessibility bus backed by an in-memory tree.
#[derive(Debug, Default)]
pub struct FakeBus {
    nodes: Mutex<BTreeMap<ObjectRef, FakeNode>>,
    extra_names: Mutex<Vec<String>>,
    performed: Mutex<Vec<(String, String)>>,
}

impl FakeBus {
    /// Creates an empty bus.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Adds or replaces a widget.
    pub fn insert(&self, node: FakeNode) {
        lock(&self.nodes).insert(node.object.clone(), node);
    }

    /// Removes the widget at `path`.
    pub fn remove(&self, path: &str) {
        lock(&self.nodes).retain(|obj, _| obj.path != path);
    }

    /// Adds a name to `ListNames` that owns no widget.
    pub fn add_name(&self, name: &str) {
        lock(&self.extra_names).push(name.into());
    }

    /// Edits the widget at `path`.
    ///
    /// # Panics
    ///
    /// Panics if no widget lives at `path`.
    pub fn update(&self, path: &str, f: impl FnOnce(&mut FakeNode)) {
        let mut nodes = lock(&self.nodes);
        let node = nodes
            .values_mut()
            .find(|n| n.object.path == path)
            .unwrap_or_else(|| panic!("no fake widget at {path}"));
        f(node);
    }

    /// Binds an [`Accessible`] to the widget at `path`.
    ///
    /// # Panics
    ///
    /// Panics if no widget lives at `path` or construction fails.
    pub fn node(self: &Arc<Self>, path: &str) -> Accessible {
        let object = lock(&self.nodes)
            .keys()
            .find(|obj| obj.path == path)
            .cloned()
            .unwrap_or_else(|| panic!("no fake widget at {path}"));
        let bus: Arc<dyn A11yBus> = Arc::clone(self) as Arc<dyn A11yBus>;
        match Accessible::new(bus, object) {
            Ok(node) => node,
            Err(e) => panic!("failed to bind fake widget at {path}: {e}"),
        }
    }

    /// `(path, action name)` of every action performed so far.
    pub fn performed(&self) -> Vec<(String, String)> {
        lock(&self.performed).clone()
    }

    fn with_node<T>(&self, obj: &ObjectRef, f: impl FnOnce(&mut FakeNode) -> Result<T>) -> Result<T> {
        let mut nodes = lock(&self.nodes);
        let node = nodes.get_mut(obj).ok_or_else(|| {
            bus_error(BusErrorKind::UnknownObject, format!("no object at {obj}"))
        })?;
        f(node)
    }
}

impl A11yBus for FakeBus {
    fn list_names(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = lock(&self.nodes)
            .keys()
            .map(|obj| obj.bus_name.clone())
            .collect();
        names.extend(lock(&self.extra_names).iter().cloned());
        Ok(names)
    }

    fn interfaces(&self, obj: &ObjectRef) -> Result<Vec<String>> {
        self.with_node(obj, |n| {
            n.interfaces.clone().ok_or_else(|| {
                bus_error(BusErrorKind::UnknownMethod, "GetInterfaces is not implemented")
            })
        })
    }

    fn string_property(&self, obj: &ObjectRef, iface: &str, name: &str) -> Result<String> {
        self.with_node(obj, |n| {
            let value = match (iface, name) {
                (interface::ACCESSIBLE, "Name") => n.name.clone(),
                (interface::ACCESSIBLE, "Description") => n.description.clone(),
                (interface::ACCESSIBLE, "HelpText") => n.help_text.clone(),
                _ => None,
            };
            value.ok_or_else(|| {
                bus_error(BusErrorKind::UnknownProperty, format!("no property {iface}.{name}"))
            })
        })
    }

    fn int_property(&self, obj: &ObjectRef, iface: &str, name: &str) -> Result<i32> {
        self.with_node(obj, |n| {
            n.require(iface)?;
            let value = match (iface, name) {
                (interface::ACTION, "NActions") => n.actions.len(),
                (interface::TEXT, "CharacterCount") => match n.stuck_character_count {
                    Some(count) => return Ok(count),
                    None => n.text.chars().count(),
                },
                _ => {
                    return Err(bus_error(
                        BusErrorKind::UnknownProperty,
                        format!("no property {iface}.{name}"),
                    ))
                }
            };
            i32::try_from(value).map_err(|e| bus_error(BusErrorKind::Other, e.to_string()))
        })
    }

    fn children(&self, obj: &ObjectRef) -> Result<Vec<ObjectRef>> {
        self.with_node(obj, |n| {
            Ok(n.children.iter().map(|path| n.sibling(path)).collect())
        })
    }

    fn role_name(&self, obj: &ObjectRef) -> Result<String> {
        self.with_node(obj, |n| Ok(n.role.clone()))
    }

    fn relation_set(&self, obj: &ObjectRef) -> Result<Vec<(u32, Vec<ObjectRef>)>> {
        self.with_node(obj, |n| {
            if n.labelled_by.is_empty() {
                return Ok(Vec::new());
            }
            let targets = n.labelled_by.iter().map(|path| n.sibling(path)).collect();
            // A "label for" relation pointing back at the widget itself.
            Ok(vec![(1, vec![n.object.clone()]), (RELATION_LABELLED_BY, targets)])
        })
    }

    fn state(&self, obj: &ObjectRef) -> Result<Vec<u32>> {
        self.with_node(obj, |n| {
            let mut words = [0u32; 2];
            for state in &n.states {
                let bit = state.bit();
                words[(bit / 32) as usize] |= 1 << (bit % 32);
            }
            Ok(words.to_vec())
        })
    }

    fn action_name(&self, obj: &ObjectRef, index: i32) -> Result<String> {
        self.with_node(obj, |n| {
            n.require(interface::ACTION)?;
            usize::try_from(index)
                .ok()
                .and_then(|i| n.actions.get(i).cloned())
                .ok_or_else(|| bus_error(BusErrorKind::Other, format!("no action {index}")))
        })
    }

    fn do_action(&self, obj: &ObjectRef, index: i32) -> Result<bool> {
        let name = self.action_name(obj, index)?;
        lock(&self.performed).push((obj.path.clone(), name));
        Ok(true)
    }

    fn grab_focus(&self, obj: &ObjectRef) -> Result<bool> {
        let mut nodes = lock(&self.nodes);
        let refuse = match nodes.get(obj) {
            Some(node) => {
                node.require(interface::COMPONENT)?;
                node.refuse_focus
            }
            None => {
                return Err(bus_error(
                    BusErrorKind::UnknownObject,
                    format!("no object at {obj}"),
                ))
            }
        };
        if refuse {
            return Ok(false);
        }
        for node in nodes.values_mut() {
            node.states.retain(|s| *s != State::Focused);
            if node.object == *obj {
                node.states.push(State::Focused);
            }
        }
        Ok(true)
    }

    fn text(&self, obj: &ObjectRef, start: i32, end: i32) -> Result<String> {
        self.with_node(obj, |n| {
            n.require(interface::TEXT)?;
            let (start, end) = char_range(&n.text, start, end);
            Ok(n.text.chars().skip(start).take(end - start).collect())
        })
    }

    fn set_text_contents(&self, obj: &ObjectRef, text: &str) -> Result<bool> {
        self.with_node(obj, |n| {
            n.require(interface::EDITABLE_TEXT)?;
            if n.read_only {
                return Ok(false);
            }
            n.text = text.into();
            Ok(true)
        })
    }

    fn insert_text(&self, obj: &ObjectRef, position: i32, text: &str) -> Result<bool> {
        self.with_node(obj, |n| {
            n.require(interface::EDITABLE_TEXT)?;
            if n.read_only {
                return Ok(false);
            }
            let (at, _) = char_range(&n.text, position, position);
            let mut chars: Vec<char> = n.text.chars().collect();
            chars.splice(at..at, text.chars());
            n.text = chars.into_iter().collect();
            Ok(true)
        })
    }

    fn delete_text(&self, obj: &ObjectRef, start: i32, end: i32) -> Result<bool> {
        self.with_node(obj, |n| {
            n.require(interface::EDITABLE_TEXT)?;
            if n.read_only {
                return Ok(false);
            }
            let (start, end) = char_range(&n.text, start, end);
            let mut chars: Vec<char> = n.text.chars().collect();
            chars.drain(start..end);
            n.text = chars.into_iter().collect();
            Ok(true)
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn bus_error(kind: BusErrorKind, message: impl Into<String>) -> Error {
    Error::Bus(BusError::new(kind, message))
}

/// Clamps a character range to the text.
fn char_range(text: &str, start: i32, end: i32) -> (usize, usize) {
    let len = text.chars().count();
    let clamp = |v: i32| usize::try_from(v).unwrap_or(0).min(len);
    let start = clamp(start);
    (start, clamp(end).max(start))
}
