//! Application roots on an accessibility bus.
//!
//! Every application registers its tree under [`ROOT_PATH`] on its own
//! unique bus name.

use std::sync::Arc;

use deskvm_error::{BusErrorKind, Error, Result};
use tracing::debug;

use crate::bus::{A11yBus, ObjectRef};
use crate::node::Accessible;

/// Object path of an application's root accessible.
pub const ROOT_PATH: &str = "/org/a11y/atspi/accessible/root";

/// Names currently on the bus, sorted and without duplicates.
pub fn bus_names(bus: &dyn A11yBus) -> Result<Vec<String>> {
    let mut names = bus.list_names()?;
    names.sort();
    names.dedup();
    Ok(names)
}

/// Root accessibles of every application on the bus.
///
/// Well-known names are ignored, as are peers that don't expose the root
/// accessible.
pub fn application_roots(bus: &Arc<dyn A11yBus>) -> Result<Vec<Accessible>> {
    let mut roots = Vec::new();
    for bus_name in bus_names(bus.as_ref())? {
        if let Some(root) = root_of(bus, &bus_name)? {
            roots.push(root);
        }
    }
    Ok(roots)
}

/// Root accessible of the application named `name`.
///
/// Returns [`Error::Search`] if no application has that name.
pub fn application_root(bus: &Arc<dyn A11yBus>, name: &str) -> Result<Accessible> {
    for bus_name in bus_names(bus.as_ref())? {
        if let Some(root) = root_of(bus, &bus_name)? {
            if root.name() == Some(name) {
                return Ok(root);
            }
        }
    }
    Err(Error::search(format!(
        "Could not find application root with name '{name}'"
    )))
}

fn root_of(bus: &Arc<dyn A11yBus>, bus_name: &str) -> Result<Option<Accessible>> {
    if !bus_name.starts_with(':') {
        return Ok(None);
    }
    match Accessible::new(Arc::clone(bus), ObjectRef::new(bus_name, ROOT_PATH)) {
        Ok(root) => Ok(Some(root)),
        Err(e)
            if matches!(
                e.bus_kind(),
                Some(BusErrorKind::UnknownInterface | BusErrorKind::UnknownObject)
            ) =>
        {
            debug!(bus_name, error = %e, "Skipping peer without accessible root");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeBus, FakeNode};

    fn desktop() -> Arc<dyn A11yBus> {
        let bus = FakeBus::new();
        bus.insert(FakeNode::new(":1.7", ROOT_PATH).name("gnome-shell").role("application"));
        bus.insert(FakeNode::new(":1.2", ROOT_PATH).name("firefox").role("application"));
        // Owns a name but no tree.
        bus.add_name(":1.4");
        bus.add_name("org.a11y.atspi.Registry");
        bus.add_name(":1.7");
        bus
    }

    #[test]
    fn test_bus_names_sorted_unique() {
        let bus = desktop();
        assert_eq!(
            bus_names(bus.as_ref()).unwrap(),
            vec![":1.2", ":1.4", ":1.7", "org.a11y.atspi.Registry"]
        );
    }

    #[test]
    fn test_application_roots_skip_non_applications() {
        let bus = desktop();
        let names: Vec<_> = application_roots(&bus)
            .unwrap()
            .iter()
            .map(|r| r.name().map(str::to_owned))
            .collect();
        assert_eq!(
            names,
            vec![Some("firefox".to_string()), Some("gnome-shell".to_string())]
        );
    }

    #[test]
    fn test_application_root_by_name() {
        let bus = desktop();
        let shell = application_root(&bus, "gnome-shell").unwrap();
        assert_eq!(shell.object().bus_name, ":1.7");
        assert_eq!(shell.object().path, ROOT_PATH);

        let err = application_root(&bus, "nautilus").unwrap_err();
        assert!(matches!(err, Error::Search(_)));
    }
}
