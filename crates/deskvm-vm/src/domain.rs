//! Hypervisor domain XML rewriting.

use deskvm_error::{Error, Result};
use tracing::debug;
use xmltree::{Element, EmitterConfig, XMLNode};

/// File name of the seed image the provisioning tool attaches at launch.
pub const CLOUD_INIT_ISO: &str = "cloud-init-config.iso";

/// Port requested for the Spice display.
const SPICE_PORT: &str = "5902";
const LOOPBACK: &str = "127.0.0.1";

/// A parsed `<domain>` definition.
#[derive(Debug, Clone)]
pub struct DomainXml {
    root: Element,
}

impl DomainXml {
    /// Parses a domain definition.
    pub fn parse(xml: &str) -> Result<Self> {
        let root = Element::parse(xml.as_bytes()).map_err(Error::xml)?;
        if root.name != "domain" {
            return Err(Error::xml(format!("expected <domain>, found <{}>", root.name)));
        }
        Ok(Self { root })
    }

    /// The `<name>` of the domain.
    #[must_use]
    pub fn name(&self) -> Option<String> {
        self.root
            .get_child("name")
            .and_then(|name| name.get_text())
            .map(|text| text.trim().to_string())
    }

    /// Target device names (`vda`, `sda`, ...) of every disk.
    #[must_use]
    pub fn disk_targets(&self) -> Vec<String> {
        self.root
            .get_child("devices")
            .map(|devices| {
                children(devices, "disk").filter_map(disk_target).collect()
            })
            .unwrap_or_default()
    }

    /// Serialized `<disk>` element whose source file is named `file_name`.
    pub fn disk_with_source_file(&self, file_name: &str) -> Result<Option<String>> {
        let Some(devices) = self.root.get_child("devices") else {
            return Ok(None);
        };
        let disk = children(devices, "disk").find(|disk| {
            disk.get_child("source")
                .and_then(|source| source.attributes.get("file"))
                .is_some_and(|file| file.rsplit('/').next() == Some(file_name))
        });
        disk.map(serialize).transpose()
    }

    /// Removes the disk attached as `target`. Returns false if there is none.
    pub fn remove_disk(&mut self, target: &str) -> bool {
        let Some(devices) = self.root.get_mut_child("devices") else {
            return false;
        };
        let before = devices.children.len();
        devices.children.retain(|node| match node {
            XMLNode::Element(e) if e.name == "disk" => {
                disk_target(e).as_deref() != Some(target)
            }
            _ => true,
        });
        devices.children.len() != before
    }

    /// Context id of the vsock device, if any.
    #[must_use]
    pub fn vsock_cid(&self) -> Option<u32> {
        let devices = self.root.get_child("devices")?;
        children(devices, "vsock")
            .filter_map(|vsock| vsock.get_child("cid"))
            .filter_map(|cid| cid.attributes.get("address"))
            .find_map(|address| address.parse().ok())
    }

    /// Installs the devices a GUI test VM needs:
    ///
    /// - a primary virtio video adapter, replacing all others
    /// - a Spice display on the loopback interface with image compression
    ///   and GL disabled, replacing all other displays
    /// - a Spice agent channel, unless one exists
    /// - a vsock device with the fixed context id `cid`, replacing any
    ///   existing one
    pub fn configure_devices(&mut self, cid: u32) -> Result<()> {
        let devices = self
            .root
            .get_mut_child("devices")
            .ok_or_else(|| Error::xml("domain has no <devices> element"))?;

        remove_children(devices, "video");
        debug!("Attaching a virtio video device");
        devices.children.push(XMLNode::Element(element(
            "video",
            &[],
            vec![element("model", &[("type", "virtio"), ("primary", "yes")], vec![])],
        )));

        remove_children(devices, "graphics");
        debug!("Attaching a Spice display");
        devices.children.push(XMLNode::Element(element(
            "graphics",
            &[
                ("type", "spice"),
                ("port", SPICE_PORT),
                ("autoport", "yes"),
                ("listen", LOOPBACK),
            ],
            vec![
                element("listen", &[("type", "address"), ("address", LOOPBACK)], vec![]),
                element("image", &[("compression", "off")], vec![]),
                element("gl", &[("enable", "no")], vec![]),
            ],
        )));

        let has_spice_channel = children(devices, "channel")
            .any(|channel| channel.attributes.get("type").map(String::as_str) == Some("spicevmc"));
        if !has_spice_channel {
            debug!("Attaching a Spice channel");
            devices.children.push(XMLNode::Element(element(
                "channel",
                &[("type", "spicevmc")],
                vec![
                    element(
                        "target",
                        &[
                            ("type", "virtio"),
                            ("name", "com.redhat.spice.0"),
                            ("state", "disconnected"),
                        ],
                        vec![],
                    ),
                    element("alias", &[("name", "channel0")], vec![]),
                    element(
                        "address",
                        &[
                            ("type", "virtio-serial"),
                            ("controller", "0"),
                            ("bus", "0"),
                            ("port", "1"),
                        ],
                        vec![],
                    ),
                ],
            )));
        }

        remove_children(devices, "vsock");
        debug!(cid, "Attaching a vsock device");
        let address = cid.to_string();
        devices.children.push(XMLNode::Element(element(
            "vsock",
            &[("model", "virtio")],
            vec![element("cid", &[("auto", "no"), ("address", address.as_str())], vec![])],
        )));

        Ok(())
    }

    /// Serializes the definition.
    pub fn to_xml(&self) -> Result<String> {
        serialize(&self.root)
    }
}

/// `<domainsnapshot>` requesting an internal snapshot of every listed disk.
pub fn internal_snapshot_xml(name: &str, description: &str, disks: &[String]) -> Result<String> {
    let disks = disks
        .iter()
        .map(|dev| element("disk", &[("name", dev.as_str()), ("snapshot", "internal")], vec![]))
        .collect();
    let snapshot = element(
        "domainsnapshot",
        &[],
        vec![
            text_element("name", name),
            text_element("description", description),
            element("disks", &[], disks),
        ],
    );
    serialize(&snapshot)
}

/// Target device name of a `<disk>` element.
pub fn disk_target(disk: &Element) -> Option<String> {
    disk.get_child("target")
        .and_then(|target| target.attributes.get("dev"))
        .cloned()
}

fn children<'a>(parent: &'a Element, name: &'a str) -> impl Iterator<Item = &'a Element> + 'a {
    parent.children.iter().filter_map(move |node| match node {
        XMLNode::Element(e) if e.name == name => Some(e),
        _ => None,
    })
}

fn remove_children(parent: &mut Element, name: &str) {
    parent
        .children
        .retain(|node| !matches!(node, XMLNode::Element(e) if e.name == name));
}

fn element(name: &str, attributes: &[(&str, &str)], children: Vec<Element>) -> Element {
    let mut e = Element::new(name);
    for (key, value) in attributes {
        e.attributes.insert((*key).to_string(), (*value).to_string());
    }
    e.children = children.into_iter().map(XMLNode::Element).collect();
    e
}

fn text_element(name: &str, text: &str) -> Element {
    let mut e = Element::new(name);
    e.children.push(XMLNode::Text(text.to_string()));
    e
}

fn serialize(e: &Element) -> Result<String> {
    let mut buf = Vec::new();
    let config = EmitterConfig::new()
        .perform_indent(true)
        .write_document_declaration(false);
    e.write_with_config(&mut buf, config).map_err(Error::xml)?;
    String::from_utf8(buf).map_err(Error::xml)
}
