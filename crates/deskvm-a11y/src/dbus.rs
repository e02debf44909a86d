//! `zbus` implementation of [`A11yBus`].

use std::io;
use std::path::Path;
use std::sync::Arc;

use deskvm_error::{BusError, BusErrorKind, Error, Result};
use serde::Serialize;
use tracing::info;
use zbus::blocking::Connection;
use zbus::zvariant::{DynamicDeserialize, DynamicType, OwnedObjectPath, OwnedValue};
use zbus::{AuthMechanism, DBusError};

use crate::bus::{interface, A11yBus, BusConnector, ObjectRef};

const PROPERTIES: &str = "org.freedesktop.DBus.Properties";

/// Accessibility bus client over a D-Bus connection.
pub struct DBusA11yBus {
    connection: Connection,
}

impl DBusA11yBus {
    /// Connects to the message bus at `address` (`unix:path=...`).
    ///
    /// Anonymous authentication is offered first: the forwarded bus belongs
    /// to a user inside the VM, so the host uid means nothing to it.
    pub fn connect(address: &str) -> Result<Self> {
        let connection = zbus::blocking::connection::Builder::address(address)
            .map_err(classify)?
            .auth_mechanisms(&[AuthMechanism::Anonymous, AuthMechanism::External])
            .build()
            .map_err(classify)?;
        Ok(Self { connection })
    }

    fn call<B, R>(&self, obj: &ObjectRef, iface: &str, method: &str, body: &B) -> Result<R>
    where
        B: Serialize + DynamicType,
        R: for<'d> DynamicDeserialize<'d>,
    {
        let reply = self
            .connection
            .call_method(
                Some(obj.bus_name.as_str()),
                obj.path.as_str(),
                Some(iface),
                method,
                body,
            )
            .map_err(classify)?;
        let body = reply.body();
        body.deserialize::<R>().map_err(classify)
    }

    fn property(&self, obj: &ObjectRef, iface: &str, name: &str) -> Result<OwnedValue> {
        self.call(obj, PROPERTIES, "Get", &(iface, name))
    }
}

impl A11yBus for DBusA11yBus {
    fn list_names(&self) -> Result<Vec<String>> {
        let dbus = ObjectRef::new("org.freedesktop.DBus", "/org/freedesktop/DBus");
        self.call(&dbus, "org.freedesktop.DBus", "ListNames", &())
    }

    fn interfaces(&self, obj: &ObjectRef) -> Result<Vec<String>> {
        self.call(obj, interface::ACCESSIBLE, "GetInterfaces", &())
    }

    fn string_property(&self, obj: &ObjectRef, iface: &str, name: &str) -> Result<String> {
        String::try_from(self.property(obj, iface, name)?).map_err(classify_value)
    }

    fn int_property(&self, obj: &ObjectRef, iface: &str, name: &str) -> Result<i32> {
        i32::try_from(self.property(obj, iface, name)?).map_err(classify_value)
    }

    fn children(&self, obj: &ObjectRef) -> Result<Vec<ObjectRef>> {
        let children: Vec<(String, OwnedObjectPath)> =
            self.call(obj, interface::ACCESSIBLE, "GetChildren", &())?;
        Ok(children.into_iter().map(object_ref).collect())
    }

    fn role_name(&self, obj: &ObjectRef) -> Result<String> {
        self.call(obj, interface::ACCESSIBLE, "GetRoleName", &())
    }

    fn relation_set(&self, obj: &ObjectRef) -> Result<Vec<(u32, Vec<ObjectRef>)>> {
        let relations: Vec<(u32, Vec<(String, OwnedObjectPath)>)> =
            self.call(obj, interface::ACCESSIBLE, "GetRelationSet", &())?;
        Ok(relations
            .into_iter()
            .map(|(kind, targets)| (kind, targets.into_iter().map(object_ref).collect()))
            .collect())
    }

    fn state(&self, obj: &ObjectRef) -> Result<Vec<u32>> {
        self.call(obj, interface::ACCESSIBLE, "GetState", &())
    }

    fn action_name(&self, obj: &ObjectRef, index: i32) -> Result<String> {
        self.call(obj, interface::ACTION, "GetName", &(index,))
    }

    fn do_action(&self, obj: &ObjectRef, index: i32) -> Result<bool> {
        self.call(obj, interface::ACTION, "DoAction", &(index,))
    }

    fn grab_focus(&self, obj: &ObjectRef) -> Result<bool> {
        self.call(obj, interface::COMPONENT, "GrabFocus", &())
    }

    fn text(&self, obj: &ObjectRef, start: i32, end: i32) -> Result<String> {
        self.call(obj, interface::TEXT, "GetText", &(start, end))
    }

    fn set_text_contents(&self, obj: &ObjectRef, text: &str) -> Result<bool> {
        self.call(obj, interface::EDITABLE_TEXT, "SetTextContents", &(text,))
    }

    fn insert_text(&self, obj: &ObjectRef, position: i32, text: &str) -> Result<bool> {
        let length = i32::try_from(text.chars().count())
            .map_err(|_| Error::remote("text too long to insert"))?;
        self.call(
            obj,
            interface::EDITABLE_TEXT,
            "InsertText",
            &(position, text, length),
        )
    }

    fn delete_text(&self, obj: &ObjectRef, start: i32, end: i32) -> Result<bool> {
        self.call(obj, interface::EDITABLE_TEXT, "DeleteText", &(start, end))
    }
}

/// Connects to forwarded buses with [`DBusA11yBus`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DBusConnector;

impl BusConnector for DBusConnector {
    fn connect(&self, socket: &Path) -> Result<Arc<dyn A11yBus>> {
        let address = format!("unix:path={}", socket.display());
        info!(%address, "Connecting to bus");
        Ok(Arc::new(DBusA11yBus::connect(&address)?))
    }
}

fn object_ref((bus_name, path): (String, OwnedObjectPath)) -> ObjectRef {
    ObjectRef::new(bus_name, path.as_str())
}

/// Maps a `zbus` failure onto a structured bus error.
fn classify(err: zbus::Error) -> Error {
    let kind = match &err {
        zbus::Error::MethodError(name, _, _) => BusErrorKind::from_error_name(name.as_str()),
        zbus::Error::FDO(fdo) => BusErrorKind::from_error_name(fdo.name().as_str()),
        zbus::Error::InputOutput(e) if e.kind() == io::ErrorKind::NotFound => {
            BusErrorKind::NotFound
        }
        _ => BusErrorKind::Other,
    };
    Error::Bus(BusError::new(kind, err.to_string()))
}

fn classify_value(err: zbus::zvariant::Error) -> Error {
    Error::Bus(BusError::new(BusErrorKind::Other, err.to_string()))
}
