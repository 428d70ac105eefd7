//! Parser for grid-engine style `qstat -xml` listings.
//!
//! Only `job_list` entries are looked at, it does not matter whether they are nested in
//! `queue_info` (running) or `job_info` (pending).

use quick_xml::{events::Event, Reader};
use thiserror::Error;
use tracing::trace;

#[derive(Error, Debug)]
pub enum QstatError {
    #[error("Malformed XML: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("Listing entry without {0}")]
    IncompleteEntry(&'static str),
}

/// One `job_list` entry. Array jobs show up once per task range that shares a state.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct JobEntry {
    pub job_id: String,
    pub name: Option<String>,
    pub state: String,
    pub tasks: Option<String>,
}

#[derive(Debug, Clone, Copy)]
enum Field {
    JobId,
    Name,
    State,
    Tasks,
}

impl Field {
    fn from_tag(tag: &[u8]) -> Option<Self> {
        match tag {
            b"JB_job_number" => Some(Self::JobId),
            b"JB_name" => Some(Self::Name),
            b"state" => Some(Self::State),
            b"tasks" => Some(Self::Tasks),
            _ => None,
        }
    }
}

pub fn parse_job_states(xml: &str) -> Result<Vec<JobEntry>, QstatError> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut entries = Vec::new();
    let mut entry: Option<JobEntry> = None;
    let mut field: Option<Field> = None;

    loop {
        match reader.read_event()? {
            Event::Start(start) => match start.name().as_ref() {
                b"job_list" => entry = Some(JobEntry::default()),
                tag => field = entry.as_ref().and(Field::from_tag(tag)),
            },
            Event::Text(text) => {
                if let (Some(entry), Some(field)) = (entry.as_mut(), field) {
                    let text = text.unescape()?.into_owned();

                    match field {
                        Field::JobId => entry.job_id = text,
                        Field::Name => entry.name = Some(text),
                        Field::State => entry.state = text,
                        Field::Tasks => entry.tasks = Some(text),
                    }
                }
            }
            Event::End(end) => match end.name().as_ref() {
                b"job_list" => {
                    if let Some(entry) = entry.take() {
                        if entry.job_id.is_empty() {
                            return Err(QstatError::IncompleteEntry("JB_job_number"));
                        }
                        if entry.state.is_empty() {
                            return Err(QstatError::IncompleteEntry("state"));
                        }

                        trace!(job_id = %entry.job_id, state = %entry.state, "Parsed listing entry");
                        entries.push(entry);
                    }
                }
                _ => field = None,
            },
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(entries)
}
