use std::collections::{BTreeSet, HashSet};

use tracing::{debug, warn};

use crate::entity::EntityKind;
use crate::import::context::ImportContext;
use crate::import::ImportOptions;
use crate::link::{validate_link_label, Cardinality, LinkRecord, LinkType};
use crate::reader::ArchiveReader;
use crate::store::{ImportStore, LinkRow, NodeSummary, StorageId};
use crate::ImportError;

/// Links already stored or accepted earlier in the run, indexed the ways the
/// cardinality rules look them up.
#[derive(Debug, Default)]
pub(crate) struct LinkIndex {
    exact: HashSet<LinkRow>,
    outgoing: HashSet<(StorageId, LinkType)>,
    outgoing_labelled: HashSet<(StorageId, String, LinkType)>,
    incoming: HashSet<(StorageId, LinkType)>,
    incoming_labelled: HashSet<(StorageId, String, LinkType)>,
}

impl LinkIndex {
    pub(crate) fn new(links: impl IntoIterator<Item = LinkRow>) -> Self {
        let mut index = Self::default();
        for link in links {
            index.insert(link);
        }
        index
    }

    pub(crate) fn insert(&mut self, link: LinkRow) {
        self.outgoing.insert((link.input_id, link.link_type));
        self.outgoing_labelled.insert((link.input_id, link.label.clone(), link.link_type));
        self.incoming.insert((link.output_id, link.link_type));
        self.incoming_labelled.insert((link.output_id, link.label.clone(), link.link_type));
        self.exact.insert(link);
    }

    fn has_outgoing(&self, link: &LinkRow, cardinality: Cardinality) -> bool {
        match cardinality {
            Cardinality::Unique => self.outgoing.contains(&(link.input_id, link.link_type)),
            Cardinality::UniquePair => self.outgoing_labelled.contains(&(
                link.input_id,
                link.label.clone(),
                link.link_type,
            )),
            Cardinality::UniqueTriple => false,
        }
    }

    fn has_incoming(&self, link: &LinkRow, cardinality: Cardinality) -> bool {
        match cardinality {
            Cardinality::Unique => self.incoming.contains(&(link.output_id, link.link_type)),
            Cardinality::UniquePair => self.incoming_labelled.contains(&(
                link.output_id,
                link.label.clone(),
                link.link_type,
            )),
            Cardinality::UniqueTriple => false,
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) enum LinkVerdict {
    /// The exact link is already present.
    Duplicate,
    Accept,
}

/// Check one resolved link against the label, endpoint-class and cardinality
/// rules of its type, in that order, after duplicate suppression.
///
/// # Errors
/// Returns [`ImportError::Validation`] naming the link or offending node.
pub(crate) fn check_link(
    index: &LinkIndex,
    link: &LinkRow,
    record: &LinkRecord,
    source: &NodeSummary,
    target: &NodeSummary,
) -> Result<LinkVerdict, ImportError> {
    if index.exact.contains(link) {
        return Ok(LinkVerdict::Duplicate);
    }

    validate_link_label(&link.label)
        .map_err(|reason| ImportError::Validation(format!("link ({record}): {reason}")))?;

    if link.input_id == link.output_id {
        return Err(ImportError::Validation(format!(
            "link ({record}) has the same node as source and target"
        )));
    }

    let rule = link.link_type.rule();
    if !source.node_type.starts_with(rule.source_prefix)
        || !target.node_type.starts_with(rule.target_prefix)
    {
        return Err(ImportError::Validation(format!(
            "cannot add a {} link from {} to {}",
            link.link_type, source.node_type, target.node_type
        )));
    }

    if index.has_outgoing(link, rule.outdegree) {
        return Err(ImportError::Validation(format!(
            "node {} already has an outgoing {} link{}",
            source.uuid,
            link.link_type,
            labelled(rule.outdegree, &link.label)
        )));
    }
    if index.has_incoming(link, rule.indegree) {
        return Err(ImportError::Validation(format!(
            "node {} already has an incoming {} link{}",
            target.uuid,
            link.link_type,
            labelled(rule.indegree, &link.label)
        )));
    }
    Ok(LinkVerdict::Accept)
}

fn labelled(cardinality: Cardinality, label: &str) -> String {
    match cardinality {
        Cardinality::UniquePair => format!(" with label `{label}`"),
        Cardinality::Unique | Cardinality::UniqueTriple => String::new(),
    }
}

/// Validate every archived link and insert the accepted ones in one bulk call.
/// Returns the `(source, target)` storage ids of the new links.
///
/// # Errors
/// [`ImportError::DanglingLink`] for unresolved endpoints unless unknown nodes
/// are skipped, and [`ImportError::Validation`] for rule violations.
pub(crate) fn import_links(
    store: &mut dyn ImportStore,
    reader: &dyn ArchiveReader,
    context: &ImportContext,
    options: &ImportOptions,
) -> Result<Vec<(StorageId, StorageId)>, ImportError> {
    if reader.link_count() == 0 {
        return Ok(Vec::new());
    }

    let mut index = LinkIndex::new(store.all_links()?);
    let node_ids = context
        .storage_ids(EntityKind::Node)
        .map(|ids| ids.values().copied().collect::<BTreeSet<_>>())
        .unwrap_or_default();
    let summaries = store.node_summaries(&node_ids, options.batch_size)?;

    let mut accepted = Vec::new();
    let mut skipped = 0_usize;
    for record in reader.iter_link_data() {
        let endpoints = (
            context.storage_id(EntityKind::Node, &record.input),
            context.storage_id(EntityKind::Node, &record.output),
        );
        let (Some(input_id), Some(output_id)) = endpoints else {
            if options.ignore_unknown_nodes {
                skipped += 1;
                continue;
            }
            return Err(ImportError::DanglingLink(format!(
                "link ({record}) references a node that is not in the archive"
            )));
        };

        let summary = |id: StorageId| {
            summaries.get(&id).ok_or_else(|| {
                ImportError::ArchiveImport(format!("node with storage id {id} could not be loaded"))
            })
        };
        let link = LinkRow {
            input_id,
            output_id,
            label: record.label.clone(),
            link_type: record.link_type,
        };
        match check_link(&index, &link, &record, summary(input_id)?, summary(output_id)?)? {
            LinkVerdict::Duplicate => {}
            LinkVerdict::Accept => {
                index.insert(link.clone());
                accepted.push(link);
            }
        }
    }

    if skipped > 0 {
        warn!(skipped, "dropped links to unknown nodes");
    }
    if !accepted.is_empty() {
        store.insert_links(&accepted, options.batch_size)?;
    }
    debug!(count = accepted.len(), "stored new links");
    Ok(accepted.iter().map(|link| (link.input_id, link.output_id)).collect())
}
