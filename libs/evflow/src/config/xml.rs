// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! XML persistence for the configuration tree.
//!
//! The on-disk format is a `<sshs version="1.0">` document with nested
//! `<node name=".." path="..">` elements holding
//! `<attr key=".." type="..">value</attr>` children. Export omits
//! attributes flagged `NO_EXPORT` and nodes without exportable content.
//! Import is tolerant: unknown nodes are created on the fly, attributes
//! that do not exist yet are created with the widest range for their type
//! and flagged `NO_EXPORT`; range or read-only violations are logged and
//! skipped. Only a malformed document root aborts the import.
//!
//! Both directions work on an in-memory snapshot, so no I/O ever happens
//! while tree locks are held.

use std::io::{BufRead, Write};
use std::sync::Arc;

use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use thiserror::Error;

use super::node::ConfigNode;
use super::value::{AttrFlags, AttrRanges, AttrType, AttrValue};

#[derive(Error, Debug)]
pub enum XmlError {
    #[error("XML I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse XML: {0}")]
    Parse(#[from] quick_xml::Error),

    #[error("invalid sshs v1.0 XML content")]
    InvalidDocument,

    #[error("multiple or no root child nodes present")]
    InvalidRootNode,

    #[error("names don't match (required in 'strict' mode)")]
    NameMismatch,
}

// ---------------------------------------------------------------------------
// Export
// ---------------------------------------------------------------------------

struct ExportNode {
    name: String,
    path: String,
    attrs: Vec<(String, AttrType, String)>,
    children: Vec<ExportNode>,
}

impl ExportNode {
    fn has_content(&self) -> bool {
        !self.attrs.is_empty() || !self.children.is_empty()
    }
}

fn snapshot(node: &Arc<ConfigNode>) -> ExportNode {
    let mut attrs = Vec::new();

    for key in node.attribute_keys() {
        let Some(ty) = node.attribute_type(&key) else {
            continue;
        };

        if node.attribute_flags(&key, ty).contains(AttrFlags::NO_EXPORT) {
            continue;
        }

        let value = node.get_attribute(&key, ty).to_value_string();
        attrs.push((key, ty, value));
    }

    let children = node
        .children()
        .iter()
        .map(snapshot)
        .filter(ExportNode::has_content)
        .collect();

    ExportNode {
        name: node.name().to_owned(),
        path: node.path().to_owned(),
        attrs,
        children,
    }
}

/// Export the subtree rooted at `node` as an `<sshs version="1.0">`
/// document.
pub fn export_to_writer<W: Write>(node: &Arc<ConfigNode>, out: W) -> Result<(), XmlError> {
    let tree = snapshot(node);

    let mut writer = Writer::new_with_indent(out, b' ', 4);

    let mut root = BytesStart::new("sshs");
    root.push_attribute(("version", "1.0"));
    writer.write_event(Event::Start(root))?;

    write_node(&mut writer, &tree)?;

    writer.write_event(Event::End(BytesEnd::new("sshs")))?;
    Ok(())
}

fn write_node<W: Write>(writer: &mut Writer<W>, node: &ExportNode) -> Result<(), XmlError> {
    let mut start = BytesStart::new("node");
    start.push_attribute(("name", node.name.as_str()));
    start.push_attribute(("path", node.path.as_str()));
    writer.write_event(Event::Start(start))?;

    for (key, ty, value) in &node.attrs {
        let mut attr = BytesStart::new("attr");
        attr.push_attribute(("key", key.as_str()));
        attr.push_attribute(("type", ty.name()));
        writer.write_event(Event::Start(attr))?;
        writer.write_event(Event::Text(BytesText::new(value)))?;
        writer.write_event(Event::End(BytesEnd::new("attr")))?;
    }

    for child in &node.children {
        write_node(writer, child)?;
    }

    writer.write_event(Event::End(BytesEnd::new("node")))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Import
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ParsedElement {
    name: String,
    attributes: Vec<(String, String)>,
    text: String,
    children: Vec<ParsedElement>,
}

impl ParsedElement {
    fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a ParsedElement> {
        self.children.iter().filter(move |c| c.name == name)
    }
}

fn parse_element_start(start: &BytesStart<'_>) -> Result<ParsedElement, XmlError> {
    let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
    let mut attributes = Vec::new();

    for attr in start.attributes() {
        let attr = attr.map_err(quick_xml::Error::from)?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(quick_xml::Error::from)?
            .into_owned();
        attributes.push((key, value));
    }

    Ok(ParsedElement {
        name,
        attributes,
        text: String::new(),
        children: Vec::new(),
    })
}

fn parse_document<R: BufRead>(input: R) -> Result<ParsedElement, XmlError> {
    let mut reader = Reader::from_reader(input);
    let mut buf = Vec::new();

    let mut stack: Vec<ParsedElement> = Vec::new();
    let mut root: Option<ParsedElement> = None;

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(start) => {
                stack.push(parse_element_start(&start)?);
            }
            Event::Empty(start) => {
                let element = parse_element_start(&start)?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(element),
                    None if root.is_none() => root = Some(element),
                    None => return Err(XmlError::InvalidDocument),
                }
            }
            Event::Text(text) => {
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(text.unescape().map_err(quick_xml::Error::from)?.trim());
                }
            }
            Event::End(_) => {
                let element = stack.pop().ok_or(XmlError::InvalidDocument)?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(element),
                    None if root.is_none() => root = Some(element),
                    None => return Err(XmlError::InvalidDocument),
                }
            }
            Event::Eof => break,
            // Declarations, comments and processing instructions are
            // irrelevant to the format.
            _ => {}
        }

        buf.clear();
    }

    if !stack.is_empty() {
        return Err(XmlError::InvalidDocument);
    }

    root.ok_or(XmlError::InvalidDocument)
}

/// Import an `<sshs version="1.0">` document into the subtree rooted at
/// `node`. In strict mode the document's root node name must match the
/// target node's name.
pub fn import_from_reader<R: BufRead>(
    node: &Arc<ConfigNode>,
    input: R,
    strict: bool,
) -> Result<(), XmlError> {
    let document = parse_document(input)?;

    if document.name != "sshs" || document.attribute("version") != Some("1.0") {
        return Err(XmlError::InvalidDocument);
    }

    let mut roots = document.children_named("node");
    let root_node = roots.next().ok_or(XmlError::InvalidRootNode)?;
    if roots.next().is_some() {
        return Err(XmlError::InvalidRootNode);
    }

    if strict {
        match root_node.attribute("name") {
            Some(name) if name == node.name() => {}
            _ => return Err(XmlError::NameMismatch),
        }
    }

    consume_node(node, root_node);
    Ok(())
}

fn consume_node(node: &Arc<ConfigNode>, content: &ParsedElement) {
    for attr in content.children_named("attr") {
        let (Some(key), Some(type_name)) = (attr.attribute("key"), attr.attribute("type")) else {
            continue;
        };

        apply_attribute(node, key, type_name, &attr.text);
    }

    for child in content.children_named("node") {
        let Some(child_name) = child.attribute("name") else {
            continue;
        };

        let child_node = node.add_child(child_name);
        consume_node(&child_node, child);
    }
}

fn apply_attribute(node: &Arc<ConfigNode>, key: &str, type_name: &str, value_str: &str) {
    let Some(ty) = AttrType::from_name(type_name) else {
        tracing::warn!(
            target: "config",
            "node '{}': attribute '{key}' has unknown type '{type_name}', skipping",
            node.path()
        );
        return;
    };

    let Some(value) = AttrValue::parse(ty, value_str) else {
        tracing::warn!(
            target: "config",
            "node '{}': attribute '{key}' (type '{ty}'): failed to convert from XML, value string was '{value_str}'",
            node.path()
        );
        return;
    };

    if node.attribute_exists(key, ty) {
        // Read-only and out-of-range violations are logged and skipped,
        // never fatal during import.
        if let Err(err) = node.put_attribute(key, value) {
            tracing::warn!(
                target: "config",
                "node '{}': attribute '{key}' (type '{ty}'): {err}, skipping",
                node.path()
            );
        }
    } else {
        // XML-loaded attributes get the widest range for their type and
        // are marked NO_EXPORT. More restrictive ranges and flags can be
        // enabled later by creating the attribute again as needed.
        node.create_attribute(
            key,
            value,
            AttrRanges::widest(ty),
            AttrFlags::NO_EXPORT,
            "XML loaded value.",
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigTree;

    fn export_string(node: &Arc<ConfigNode>) -> String {
        let mut out = Vec::new();
        export_to_writer(node, &mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_export_structure() {
        let tree = ConfigTree::new();
        let cam = tree.node("/cam/");
        cam.create_short("moduleId", 1, 0, i16::MAX, AttrFlags::NORMAL, "");
        cam.create_string("moduleLibrary", "dvs128", 1, 256, AttrFlags::NORMAL, "");

        let xml = export_string(tree.root());
        assert!(xml.starts_with("<sshs version=\"1.0\">"));
        assert!(xml.contains("<node name=\"cam\" path=\"/cam/\">"));
        assert!(xml.contains("<attr key=\"moduleId\" type=\"short\">1</attr>"));
        assert!(xml.contains("<attr key=\"moduleLibrary\" type=\"string\">dvs128</attr>"));
    }

    #[test]
    fn test_export_skips_no_export_and_empty_nodes() {
        let tree = ConfigTree::new();
        let cam = tree.node("/cam/");
        cam.create_int("visible", 1, 0, 10, AttrFlags::NORMAL, "");
        cam.create_int("hidden", 2, 0, 10, AttrFlags::NO_EXPORT, "");
        tree.node("/empty/sub/");

        let xml = export_string(tree.root());
        assert!(xml.contains("visible"));
        assert!(!xml.contains("hidden"));
        assert!(!xml.contains("empty"));
    }

    #[test]
    fn test_import_creates_nodes_and_attributes() {
        let xml = r#"<sshs version="1.0">
            <node name="" path="/">
                <node name="cam" path="/cam/">
                    <attr key="moduleId" type="short">3</attr>
                    <attr key="bias" type="float">0.25</attr>
                </node>
            </node>
        </sshs>"#;

        let tree = ConfigTree::new();
        import_from_reader(tree.root(), xml.as_bytes(), false).unwrap();

        let cam = tree.get_node("/cam/").unwrap();
        assert_eq!(cam.get_short("moduleId"), 3);
        assert_eq!(cam.get_float("bias"), 0.25);
        // On-the-fly attributes are NO_EXPORT with the widest range.
        assert!(cam
            .attribute_flags("bias", AttrType::Float)
            .contains(AttrFlags::NO_EXPORT));
    }

    #[test]
    fn test_import_skips_violations() {
        let tree = ConfigTree::new();
        let cam = tree.node("/cam/");
        cam.create_int("gain", 1, 0, 8, AttrFlags::NORMAL, "");
        cam.create_string("serial", "X", 0, 16, AttrFlags::READ_ONLY, "");

        let xml = r#"<sshs version="1.0">
            <node name="" path="/">
                <node name="cam" path="/cam/">
                    <attr key="gain" type="int">200</attr>
                    <attr key="serial" type="string">Y</attr>
                    <attr key="broken" type="int">not-a-number</attr>
                </node>
            </node>
        </sshs>"#;

        import_from_reader(tree.root(), xml.as_bytes(), false).unwrap();

        // Out-of-range, read-only and unparseable values are skipped.
        assert_eq!(cam.get_int("gain"), 1);
        assert_eq!(cam.get_string("serial"), "X");
        assert!(!cam.attribute_exists("broken", AttrType::Int));
    }

    #[test]
    fn test_import_rejects_malformed_root() {
        let tree = ConfigTree::new();

        let wrong_root = r#"<config version="1.0"><node name=""/></config>"#;
        assert!(matches!(
            import_from_reader(tree.root(), wrong_root.as_bytes(), false),
            Err(XmlError::InvalidDocument)
        ));

        let two_roots =
            r#"<sshs version="1.0"><node name="a"/><node name="b"/></sshs>"#;
        assert!(matches!(
            import_from_reader(tree.root(), two_roots.as_bytes(), false),
            Err(XmlError::InvalidRootNode)
        ));
    }

    #[test]
    fn test_strict_mode_requires_matching_name() {
        let tree = ConfigTree::new();
        let xml = r#"<sshs version="1.0"><node name="other"/></sshs>"#;

        assert!(matches!(
            import_from_reader(tree.root(), xml.as_bytes(), true),
            Err(XmlError::NameMismatch)
        ));

        let ok = r#"<sshs version="1.0"><node name=""/></sshs>"#;
        import_from_reader(tree.root(), ok.as_bytes(), true).unwrap();
    }

    #[test]
    fn test_round_trip_all_types() {
        let tree = ConfigTree::new();
        let dev = tree.node("/device/");
        dev.create_bool("running", true, AttrFlags::NORMAL, "");
        dev.create_byte("b", -3, i8::MIN, i8::MAX, AttrFlags::NORMAL, "");
        dev.create_short("s", 300, i16::MIN, i16::MAX, AttrFlags::NORMAL, "");
        dev.create_int("i", -70000, i32::MIN, i32::MAX, AttrFlags::NORMAL, "");
        dev.create_long("l", 1 << 40, i64::MIN, i64::MAX, AttrFlags::NORMAL, "");
        dev.create_float("f", 0.5, f32::MIN, f32::MAX, AttrFlags::NORMAL, "");
        dev.create_double("d", -1.25, f64::MIN, f64::MAX, AttrFlags::NORMAL, "");
        dev.create_string("str", "a <b> & 'c'", 0, 64, AttrFlags::NORMAL, "");
        let sub = tree.node("/device/sub/");
        sub.create_int("nested", 7, 0, 10, AttrFlags::NORMAL, "");

        let xml = export_string(tree.root());

        let fresh = ConfigTree::new();
        import_from_reader(fresh.root(), xml.as_bytes(), true).unwrap();

        let dev2 = fresh.get_node("/device/").unwrap();
        assert!(dev2.get_bool("running"));
        assert_eq!(dev2.get_byte("b"), -3);
        assert_eq!(dev2.get_short("s"), 300);
        assert_eq!(dev2.get_int("i"), -70000);
        assert_eq!(dev2.get_long("l"), 1 << 40);
        assert_eq!(dev2.get_float("f"), 0.5);
        assert_eq!(dev2.get_double("d"), -1.25);
        assert_eq!(dev2.get_string("str"), "a <b> & 'c'");
        assert_eq!(
            fresh.get_node("/device/sub/").unwrap().get_int("nested"),
            7
        );
    }
}
