use std::io::BufRead;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use screening_core::{Entity, EntitySource, EntityType, IdentityDocument};

use crate::{ParsedList, SourceError, SourceFormat, ValidationReport};

/// Parse a list in the given format.
///
/// # Errors
/// Returns [`SourceError::Malformed`] when the XML cannot be read.
pub fn parse_list<R: BufRead>(
    format: SourceFormat,
    source: EntitySource,
    reader: R,
) -> Result<ParsedList, SourceError> {
    match format {
        SourceFormat::OfacSdn => parse_ofac_sdn(source, reader),
        SourceFormat::UnConsolidated => parse_un_consolidated(source, reader),
    }
}

enum Visit<'a> {
    Open { path: &'a [String], start: &'a BytesStart<'a> },
    Close { path: &'a [String], text: &'a str },
}

fn walk<R: BufRead>(
    source: EntitySource,
    reader: R,
    mut visit: impl FnMut(Visit<'_>),
) -> Result<(), SourceError> {
    let mut reader = Reader::from_reader(reader);
    reader.config_mut().trim_text(true);

    let malformed = |reason: String| SourceError::Malformed { source_name: source, reason };
    let mut buf = Vec::new();
    let mut path: Vec<String> = Vec::new();
    let mut text = String::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(start)) => {
                path.push(String::from_utf8_lossy(start.local_name().as_ref()).into_owned());
                text.clear();
                visit(Visit::Open { path: &path, start: &start });
            }
            Ok(Event::Empty(start)) => {
                path.push(String::from_utf8_lossy(start.local_name().as_ref()).into_owned());
                visit(Visit::Open { path: &path, start: &start });
                visit(Visit::Close { path: &path, text: "" });
                path.pop();
            }
            Ok(Event::Text(chunk)) => {
                let unescaped = chunk.unescape().map_err(|err| malformed(err.to_string()))?;
                text.push_str(&unescaped);
            }
            Ok(Event::CData(chunk)) => {
                text.push_str(&String::from_utf8_lossy(&chunk.into_inner()));
            }
            Ok(Event::End(_)) => {
                visit(Visit::Close { path: &path, text: text.trim() });
                text.clear();
                path.pop();
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(err) => {
                return Err(malformed(format!(
                    "at byte {}: {err}",
                    reader.error_position()
                )))
            }
        }
        buf.clear();
    }

    if !path.is_empty() {
        return Err(malformed(format!("document ended inside <{}>", path.join("/"))));
    }
    Ok(())
}

/// Path below the first element named `anchor`, when inside one.
fn relative<'a>(path: &'a [String], anchor: &str) -> Option<Vec<&'a str>> {
    let index = path.iter().position(|segment| segment == anchor)?;
    Some(path[index + 1..].iter().map(String::as_str).collect())
}

fn ends_with(path: &[String], tail: &[&str]) -> bool {
    path.len() >= tail.len()
        && path[path.len() - tail.len()..].iter().zip(tail).all(|(segment, name)| segment == name)
}

fn non_empty(text: &str) -> Option<String> {
    let trimmed = text.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn join_names<'a>(parts: impl IntoIterator<Item = &'a Option<String>>) -> String {
    parts.into_iter().flatten().map(String::as_str).collect::<Vec<_>>().join(" ")
}

#[derive(Default)]
struct EntityDraft {
    id: Option<String>,
    entity_type: EntityType,
    name_parts: [Option<String>; 4],
    aliases: Vec<String>,
    countries: Vec<String>,
    documents: Vec<IdentityDocument>,
    programs: Vec<String>,
    date_of_birth: Option<String>,
    nationality: Option<String>,
    alias_parts: [Option<String>; 2],
    document: [Option<String>; 3],
}

impl EntityDraft {
    fn add_country(&mut self, country: &str) {
        if let Some(country) = non_empty(country) {
            if !self.countries.contains(&country) {
                self.countries.push(country);
            }
        }
    }

    fn push_document(&mut self) {
        let [doc_type, number, country] = std::mem::take(&mut self.document);
        if let Some(number) = number {
            self.documents.push(IdentityDocument { doc_type, number, country });
        }
    }

    fn push_alias(&mut self, alias: String) {
        if !alias.is_empty() && !self.aliases.contains(&alias) {
            self.aliases.push(alias);
        }
    }

    fn finish(
        self,
        source: EntitySource,
        first_name: Option<String>,
        last_name: Option<String>,
        report: &mut ValidationReport,
    ) -> Option<Entity> {
        let name = join_names(&self.name_parts);
        let Some(id) = self.id else {
            report.errors.push(format!("{source} entry without identifier skipped ({name})"));
            return None;
        };
        if name.is_empty() {
            report.errors.push(format!("{source} entry {id} has no name; skipped"));
            return None;
        }
        Some(Entity {
            id,
            source,
            entity_type: self.entity_type,
            all_names: vec![name.clone()],
            name,
            aliases: self.aliases,
            first_name,
            last_name,
            countries: self.countries,
            identity_documents: self.documents,
            program: (!self.programs.is_empty()).then(|| self.programs.join(", ")),
            date_of_birth: self.date_of_birth,
            nationality: self.nationality,
        })
    }
}

fn finalize(
    source: EntitySource,
    entities: Vec<Entity>,
    published: Option<String>,
    mut report: ValidationReport,
) -> Result<ParsedList, SourceError> {
    if entities.is_empty() {
        return Err(SourceError::Empty { source_name: source });
    }
    if published.is_none() {
        report.warnings.push(format!("{source} list carries no publication date"));
    }
    let mut seen = std::collections::BTreeSet::new();
    for entity in &entities {
        if !seen.insert(entity.id.as_str()) {
            report.warnings.push(format!("{source} entry {} appears more than once", entity.id));
        }
    }
    Ok(ParsedList { source, entities, published, report })
}

/// Parse the classic OFAC SDN XML (`sdnList` / `sdnEntry`).
///
/// # Errors
/// Returns [`SourceError::Malformed`] on unreadable XML and
/// [`SourceError::Empty`] when no usable entry was found.
pub fn parse_ofac_sdn<R: BufRead>(
    source: EntitySource,
    reader: R,
) -> Result<ParsedList, SourceError> {
    let mut entities = Vec::new();
    let mut report = ValidationReport::default();
    let mut published = None;
    let mut draft: Option<EntityDraft> = None;

    walk(source, reader, |visit| match visit {
        Visit::Open { path, .. } => {
            if path.last().is_some_and(|name| name == "sdnEntry") {
                draft = Some(EntityDraft::default());
            }
        }
        Visit::Close { path, text } => {
            let Some(rel) = relative(path, "sdnEntry") else {
                if ends_with(path, &["publshInformation", "Publish_Date"]) {
                    published = non_empty(text);
                }
                return;
            };
            let Some(entry) = draft.as_mut() else { return };
            match rel.as_slice() {
                [] => {
                    if let Some(entry) = draft.take() {
                        let first = entry.name_parts[0].clone();
                        let last = entry.name_parts[1].clone();
                        entities.extend(entry.finish(source, first, last, &mut report));
                    }
                }
                ["uid"] => entry.id = non_empty(text),
                ["firstName"] => entry.name_parts[0] = non_empty(text),
                ["lastName"] => entry.name_parts[1] = non_empty(text),
                ["sdnType"] => entry.entity_type = EntityType::parse(text),
                ["programList", "program"] => entry.programs.extend(non_empty(text)),
                ["idList", "id", "idType"] => entry.document[0] = non_empty(text),
                ["idList", "id", "idNumber"] => entry.document[1] = non_empty(text),
                ["idList", "id", "idCountry"] => entry.document[2] = non_empty(text),
                ["idList", "id"] => entry.push_document(),
                ["akaList", "aka", "firstName"] => entry.alias_parts[0] = non_empty(text),
                ["akaList", "aka", "lastName"] => entry.alias_parts[1] = non_empty(text),
                ["akaList", "aka"] => {
                    let parts = std::mem::take(&mut entry.alias_parts);
                    entry.push_alias(join_names(&parts));
                }
                ["addressList", "address", "country"]
                | ["citizenshipList", "citizenship", "country"] => entry.add_country(text),
                ["nationalityList", "nationality", "country"] => {
                    if entry.nationality.is_none() {
                        entry.nationality = non_empty(text);
                    }
                    entry.add_country(text);
                }
                ["dateOfBirthList", "dateOfBirthItem", "dateOfBirth"] => {
                    if entry.date_of_birth.is_none() {
                        entry.date_of_birth = non_empty(text);
                    }
                }
                _ => {}
            }
        }
    })?;

    finalize(source, entities, published, report)
}

/// Parse the UN Security Council consolidated list (`INDIVIDUAL` / `ENTITY`).
///
/// # Errors
/// Returns [`SourceError::Malformed`] on unreadable XML and
/// [`SourceError::Empty`] when no usable entry was found.
pub fn parse_un_consolidated<R: BufRead>(
    source: EntitySource,
    reader: R,
) -> Result<ParsedList, SourceError> {
    let mut entities = Vec::new();
    let mut report = ValidationReport::default();
    let mut published = None;
    let mut draft: Option<EntityDraft> = None;

    walk(source, reader, |visit| match visit {
        Visit::Open { path, start } => match path.last().map(String::as_str) {
            Some("CONSOLIDATED_LIST") => {
                if let Ok(Some(attr)) = start.try_get_attribute("dateGenerated") {
                    published = attr.unescape_value().ok().and_then(|value| non_empty(&value));
                }
            }
            Some("INDIVIDUAL") => {
                draft = Some(EntityDraft {
                    entity_type: EntityType::Individual,
                    ..EntityDraft::default()
                });
            }
            Some("ENTITY") => {
                draft =
                    Some(EntityDraft { entity_type: EntityType::Entity, ..EntityDraft::default() });
            }
            _ => {}
        },
        Visit::Close { path, text } => {
            let rel = relative(path, "INDIVIDUAL").or_else(|| relative(path, "ENTITY"));
            let Some(rel) = rel else { return };
            let Some(entry) = draft.as_mut() else { return };
            match rel.as_slice() {
                [] => {
                    if let Some(entry) = draft.take() {
                        let individual = entry.entity_type == EntityType::Individual;
                        let first = individual.then(|| entry.name_parts[0].clone()).flatten();
                        let last = if individual {
                            entry.name_parts[1..].iter().rev().flatten().next().cloned()
                        } else {
                            None
                        };
                        entities.extend(entry.finish(source, first, last, &mut report));
                    }
                }
                ["REFERENCE_NUMBER"] => entry.id = non_empty(text),
                ["DATAID"] => {
                    if entry.id.is_none() {
                        entry.id = non_empty(text);
                    }
                }
                ["FIRST_NAME"] => entry.name_parts[0] = non_empty(text),
                ["SECOND_NAME"] => entry.name_parts[1] = non_empty(text),
                ["THIRD_NAME"] => entry.name_parts[2] = non_empty(text),
                ["FOURTH_NAME"] => entry.name_parts[3] = non_empty(text),
                ["UN_LIST_TYPE"] => entry.programs.extend(non_empty(text)),
                ["NATIONALITY", "VALUE"] => {
                    if entry.nationality.is_none() {
                        entry.nationality = non_empty(text);
                    }
                    entry.add_country(text);
                }
                ["INDIVIDUAL_ALIAS" | "ENTITY_ALIAS", "ALIAS_NAME"] => {
                    if let Some(alias) = non_empty(text) {
                        entry.push_alias(alias);
                    }
                }
                ["INDIVIDUAL_ADDRESS" | "ENTITY_ADDRESS", "COUNTRY"]
                | ["INDIVIDUAL_PLACE_OF_BIRTH", "COUNTRY"] => entry.add_country(text),
                ["INDIVIDUAL_DATE_OF_BIRTH", "DATE" | "YEAR"] => {
                    if entry.date_of_birth.is_none() {
                        entry.date_of_birth = non_empty(text);
                    }
                }
                ["INDIVIDUAL_DOCUMENT", "TYPE_OF_DOCUMENT"] => entry.document[0] = non_empty(text),
                ["INDIVIDUAL_DOCUMENT", "NUMBER"] => entry.document[1] = non_empty(text),
                ["INDIVIDUAL_DOCUMENT", "ISSUING_COUNTRY"] => entry.document[2] = non_empty(text),
                ["INDIVIDUAL_DOCUMENT"] => entry.push_document(),
                _ => {}
            }
        }
    })?;

    finalize(source, entities, published, report)
}

#[cfg(test)]
mod tests {
    use super::*;

    const OFAC_FIXTURE: &str = r#"<?xml version="1.0" standalone="yes"?>
<sdnList xmlns="http://tempuri.org/sdnList.xsd">
  <publshInformation>
    <Publish_Date>10/01/2026</Publish_Date>
    <Record_Count>2</Record_Count>
  </publshInformation>
  <sdnEntry>
    <uid>7001</uid>
    <firstName>Juan Carlos</firstName>
    <lastName>PEREZ GOMEZ</lastName>
    <sdnType>Individual</sdnType>
    <programList><program>VENEZUELA</program><program>SDNTK</program></programList>
    <idList>
      <id><uid>1</uid><idType>Passport</idType><idNumber>P-991</idNumber><idCountry>Venezuela</idCountry></id>
    </idList>
    <akaList>
      <aka><uid>2</uid><type>a.k.a.</type><category>strong</category><lastName>EL FLACO</lastName></aka>
    </akaList>
    <nationalityList>
      <nationality><uid>3</uid><country>Venezuela</country><mainEntry>true</mainEntry></nationality>
    </nationalityList>
    <dateOfBirthList>
      <dateOfBirthItem><uid>4</uid><dateOfBirth>12 Jan 1970</dateOfBirth><mainEntry>true</mainEntry></dateOfBirthItem>
    </dateOfBirthList>
  </sdnEntry>
  <sdnEntry>
    <uid>7002</uid>
    <lastName>BANCO EJEMPLO &amp; CIA</lastName>
    <sdnType>Entity</sdnType>
    <addressList><address><uid>5</uid><city>Caracas</city><country>Venezuela</country></address></addressList>
  </sdnEntry>
  <sdnEntry>
    <uid>7003</uid>
    <sdnType>Entity</sdnType>
  </sdnEntry>
</sdnList>"#;

    const UN_FIXTURE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<CONSOLIDATED_LIST dateGenerated="2026-10-01T00:00:00.000Z">
  <INDIVIDUALS>
    <INDIVIDUAL>
      <DATAID>6908555</DATAID>
      <REFERENCE_NUMBER>QDi.001</REFERENCE_NUMBER>
      <FIRST_NAME>AHMED</FIRST_NAME>
      <SECOND_NAME>AL</SECOND_NAME>
      <THIRD_NAME>RASHID</THIRD_NAME>
      <UN_LIST_TYPE>Al-Qaida</UN_LIST_TYPE>
      <NATIONALITY><VALUE>Pakistan</VALUE></NATIONALITY>
      <INDIVIDUAL_ALIAS><QUALITY>Good</QUALITY><ALIAS_NAME>Abu Ahmed</ALIAS_NAME></INDIVIDUAL_ALIAS>
      <INDIVIDUAL_ADDRESS><COUNTRY>Afghanistan</COUNTRY></INDIVIDUAL_ADDRESS>
      <INDIVIDUAL_DATE_OF_BIRTH><TYPE_OF_DATE>EXACT</TYPE_OF_DATE><DATE>1965-03-04</DATE></INDIVIDUAL_DATE_OF_BIRTH>
      <INDIVIDUAL_DOCUMENT><TYPE_OF_DOCUMENT>Passport</TYPE_OF_DOCUMENT><NUMBER>A1234567</NUMBER><ISSUING_COUNTRY>Pakistan</ISSUING_COUNTRY></INDIVIDUAL_DOCUMENT>
    </INDIVIDUAL>
  </INDIVIDUALS>
  <ENTITIES>
    <ENTITY>
      <DATAID>110</DATAID>
      <REFERENCE_NUMBER>QDe.002</REFERENCE_NUMBER>
      <FIRST_NAME>EXAMPLE RELIEF FOUNDATION</FIRST_NAME>
      <ENTITY_ALIAS><ALIAS_NAME>ERF</ALIAS_NAME></ENTITY_ALIAS>
      <ENTITY_ADDRESS><COUNTRY>Somalia</COUNTRY></ENTITY_ADDRESS>
    </ENTITY>
  </ENTITIES>
</CONSOLIDATED_LIST>"#;

    #[test]
    fn ofac_entries_are_parsed_with_documents_and_aliases() -> Result<(), SourceError> {
        let list = parse_ofac_sdn(EntitySource::Ofac, OFAC_FIXTURE.as_bytes())?;
        assert_eq!(list.published.as_deref(), Some("10/01/2026"));
        assert_eq!(list.entities.len(), 2);

        let person = &list.entities[0];
        assert_eq!(person.id, "7001");
        assert_eq!(person.name, "Juan Carlos PEREZ GOMEZ");
        assert_eq!(person.entity_type, EntityType::Individual);
        assert_eq!(person.aliases, vec!["EL FLACO".to_string()]);
        assert_eq!(person.identity_documents.len(), 1);
        assert_eq!(person.identity_documents[0].number, "P-991");
        assert_eq!(person.nationality.as_deref(), Some("Venezuela"));
        assert_eq!(person.date_of_birth.as_deref(), Some("12 Jan 1970"));
        assert_eq!(person.program.as_deref(), Some("VENEZUELA, SDNTK"));

        let bank = &list.entities[1];
        assert_eq!(bank.name, "BANCO EJEMPLO & CIA");
        assert_eq!(bank.countries, vec!["Venezuela".to_string()]);
        Ok(())
    }

    #[test]
    fn ofac_entry_without_name_is_reported_and_skipped() -> Result<(), SourceError> {
        let list = parse_ofac_sdn(EntitySource::Ofac, OFAC_FIXTURE.as_bytes())?;
        assert_eq!(list.report.errors.len(), 1);
        assert!(list.report.errors[0].contains("7003"));
        Ok(())
    }

    #[test]
    fn un_individuals_and_entities_are_parsed() -> Result<(), SourceError> {
        let list = parse_un_consolidated(EntitySource::Un, UN_FIXTURE.as_bytes())?;
        assert_eq!(list.published.as_deref(), Some("2026-10-01T00:00:00.000Z"));
        assert_eq!(list.entities.len(), 2);

        let person = &list.entities[0];
        assert_eq!(person.id, "QDi.001");
        assert_eq!(person.name, "AHMED AL RASHID");
        assert_eq!(person.last_name.as_deref(), Some("RASHID"));
        assert_eq!(person.aliases, vec!["Abu Ahmed".to_string()]);
        assert_eq!(person.identity_documents[0].number, "A1234567");
        assert!(person.countries.contains(&"Afghanistan".to_string()));

        let org = &list.entities[1];
        assert_eq!(org.entity_type, EntityType::Entity);
        assert_eq!(org.name, "EXAMPLE RELIEF FOUNDATION");
        assert!(list.report.errors.is_empty());
        Ok(())
    }

    #[test]
    fn list_without_entries_is_empty_error() {
        let xml = "<CONSOLIDATED_LIST><INDIVIDUALS/></CONSOLIDATED_LIST>";
        match parse_un_consolidated(EntitySource::Un, xml.as_bytes()) {
            Err(SourceError::Empty { source_name }) => assert_eq!(source_name, EntitySource::Un),
            other => panic!("expected empty list error, got {other:?}"),
        }
    }

    #[test]
    fn truncated_document_is_malformed() {
        let xml = "<sdnList><sdnEntry><uid>1</uid><lastName>X";
        match parse_ofac_sdn(EntitySource::Ofac, xml.as_bytes()) {
            Err(SourceError::Malformed { .. }) => {}
            other => panic!("expected malformed error, got {other:?}"),
        }
    }
}
