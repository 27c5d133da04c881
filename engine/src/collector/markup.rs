use quick_xml::Reader;
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use serde::Serialize;

use super::CollectionError;

/// `<root><record><field>value</field>...</record>...</root>`.
///
/// Attributes are kept on every level, in document order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MarkupDocument {
    pub root: String,
    pub attributes: Vec<(String, String)>,
    pub records: Vec<MarkupRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MarkupRecord {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub fields: Vec<MarkupField>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MarkupField {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub value: String,
}

/// Where the parser is in the three-level shape.
enum Depth {
    BeforeRoot,
    InRoot,
    InRecord(MarkupRecord),
    InField(MarkupRecord, MarkupField),
    AfterRoot,
}

/// Name and unescaped attributes of a start or empty tag.
fn element(e: &BytesStart<'_>) -> Result<(String, Vec<(String, String)>), CollectionError> {
    let name = std::str::from_utf8(e.name().as_ref())
        .map_err(CollectionError::unparseable)?
        .to_string();

    let mut attributes = Vec::new();
    for attr in e.attributes() {
        let attr = attr.map_err(CollectionError::unparseable)?;
        let key = std::str::from_utf8(attr.key.as_ref())
            .map_err(CollectionError::unparseable)?
            .to_string();
        let value = attr
            .unescape_value()
            .map_err(CollectionError::unparseable)?
            .into_owned();
        attributes.push((key, value));
    }
    Ok((name, attributes))
}

fn record(e: &BytesStart<'_>) -> Result<MarkupRecord, CollectionError> {
    let (name, attributes) = element(e)?;
    Ok(MarkupRecord {
        name,
        attributes,
        fields: Vec::new(),
    })
}

fn field(e: &BytesStart<'_>) -> Result<MarkupField, CollectionError> {
    let (name, attributes) = element(e)?;
    Ok(MarkupField {
        name,
        attributes,
        value: String::new(),
    })
}

fn is_whitespace(bytes: &[u8]) -> bool {
    bytes.iter().all(u8::is_ascii_whitespace)
}

fn tag<'a>(name: &'a str, attributes: &'a [(String, String)]) -> BytesStart<'a> {
    BytesStart::new(name).with_attributes(
        attributes
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str())),
    )
}

impl MarkupDocument {
    /// Strict parse: exactly one root, records directly below it, leaf fields
    /// below records. Text is only allowed inside fields; elsewhere it must be
    /// whitespace.
    pub fn parse(bytes: &[u8]) -> Result<Self, CollectionError> {
        let mut reader = Reader::from_reader(bytes);
        let mut root = String::new();
        let mut root_attributes = Vec::new();
        let mut records = Vec::new();
        let mut depth = Depth::BeforeRoot;

        loop {
            let event = reader.read_event().map_err(|e| {
                CollectionError::unparseable(format!(
                    "at byte {}: {e}",
                    reader.buffer_position()
                ))
            })?;

            depth = match (depth, event) {
                (d, Event::Eof) => {
                    depth = d;
                    break;
                }
                (d, Event::Decl(_) | Event::Comment(_) | Event::PI(_) | Event::DocType(_)) => d,

                (Depth::BeforeRoot, Event::Start(e)) => {
                    (root, root_attributes) = element(&e)?;
                    Depth::InRoot
                }
                (Depth::BeforeRoot, Event::Empty(e)) => {
                    (root, root_attributes) = element(&e)?;
                    Depth::AfterRoot
                }

                (Depth::InRoot, Event::Start(e)) => Depth::InRecord(record(&e)?),
                (Depth::InRoot, Event::Empty(e)) => {
                    records.push(record(&e)?);
                    Depth::InRoot
                }
                (Depth::InRoot, Event::End(_)) => Depth::AfterRoot,

                (Depth::InRecord(record), Event::Start(e)) => Depth::InField(record, field(&e)?),
                (Depth::InRecord(mut record), Event::Empty(e)) => {
                    record.fields.push(field(&e)?);
                    Depth::InRecord(record)
                }
                (Depth::InRecord(record), Event::End(_)) => {
                    records.push(record);
                    Depth::InRoot
                }

                (Depth::InField(record, mut field), Event::Text(t)) => {
                    let text = t.unescape().map_err(CollectionError::unparseable)?;
                    field.value.push_str(&text);
                    Depth::InField(record, field)
                }
                (Depth::InField(record, mut field), Event::CData(c)) => {
                    let text = std::str::from_utf8(&c).map_err(CollectionError::unparseable)?;
                    field.value.push_str(text);
                    Depth::InField(record, field)
                }
                (Depth::InField(mut record, field), Event::End(_)) => {
                    record.fields.push(field);
                    Depth::InRecord(record)
                }
                (Depth::InField(_, field), Event::Start(_) | Event::Empty(_)) => {
                    return Err(CollectionError::unparseable(format!(
                        "field <{}> contains nested elements",
                        field.name
                    )));
                }

                (d, Event::Text(t)) if is_whitespace(&t) => d,
                (Depth::AfterRoot, Event::Start(_) | Event::Empty(_)) => {
                    return Err(CollectionError::unparseable("multiple root elements"));
                }
                (_, Event::Text(_) | Event::CData(_)) => {
                    return Err(CollectionError::unparseable("text outside a field element"));
                }
                (_, Event::End(_)) => {
                    return Err(CollectionError::unparseable("unexpected closing tag"));
                }
            };
        }

        if !matches!(depth, Depth::AfterRoot) {
            return Err(CollectionError::unparseable("document is incomplete"));
        }
        Ok(Self {
            root,
            attributes: root_attributes,
            records,
        })
    }

    pub fn render(&self) -> std::io::Result<Vec<u8>> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

        let root = tag(&self.root, &self.attributes);
        if self.records.is_empty() {
            writer.write_event(Event::Empty(root))?;
            return Ok(finish(writer));
        }

        writer.write_event(Event::Start(root))?;
        for record in &self.records {
            let start = tag(&record.name, &record.attributes);
            if record.fields.is_empty() {
                writer.write_event(Event::Empty(start))?;
                continue;
            }
            writer.write_event(Event::Start(start))?;
            for field in &record.fields {
                let start = tag(&field.name, &field.attributes);
                if field.value.is_empty() {
                    writer.write_event(Event::Empty(start))?;
                } else {
                    writer.write_event(Event::Start(start))?;
                    writer.write_event(Event::Text(BytesText::new(&field.value)))?;
                    writer.write_event(Event::End(BytesEnd::new(field.name.as_str())))?;
                }
            }
            writer.write_event(Event::End(BytesEnd::new(record.name.as_str())))?;
        }
        writer.write_event(Event::End(BytesEnd::new(self.root.as_str())))?;
        Ok(finish(writer))
    }
}

fn finish(writer: Writer<Vec<u8>>) -> Vec<u8> {
    let mut out = writer.into_inner();
    out.push(b'\n');
    out
}
