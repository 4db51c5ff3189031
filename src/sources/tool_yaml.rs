//! Tool registry YAML ingestion.
//!
//! Teams describe their tools in `tellus.yml` files kept in their own
//! repositories. A provider (the connector half, injected) fetches the
//! files; this source parses them. The first YAML document in a file is the
//! primary tool tell; any further documents become related tells grouped
//! under the primary, with `-suffix` aliases expanded against the primary's
//! alias and a `*` tag inheriting the primary's tags.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::RwLock;

use crate::config::Category;
use crate::error::Result;
use crate::sources::{Source, SourceInfo};
use crate::tell::{DataBlock, PROP_ALIAS, PROP_TAGS};
use crate::teller::Teller;

/// Matches the tool category string, so writes under this source id place
/// tells in the tool category automatically.
pub const SOURCE_ID: &str = "tellus-tool";

/// File names recognized as tool definitions.
pub const VALID_TOOL_FILE_NAMES: &[&str] =
    &["tellus.yml", ".tellus.yml", "tellus.yaml", ".tellus.yaml"];

/// A document carrying this marker (truthily) is skipped.
pub const IGNORE_MARKER: &str = "tellus-ignore";

/// The internal tell holding tool-keyword configuration.
pub const CONFIG_TOOLS_ALIAS: &str = "tellus-config-tools";

/// Keywords promoted from tool definitions into per-keyword index tells.
pub const TOOL_KEYWORDS: &[(&str, &str)] = &[
    ("docs", "Docs"),
    ("builds", "Builds"),
    ("repo", "Repository"),
    ("dashboards", "Dashboards"),
];

const REPO_DATUM: &str = "source-repo";
const TOOLS_TELL_PREFIX: &str = "tellus-tools-";
const ENABLED_TAG: &str = "enabled";

/// One fetched tool definition file.
#[derive(Debug, Clone)]
pub struct ToolFile {
    /// URL of the repository the file came from.
    pub repo_url: String,
    /// Path (or name) of the file within the repository.
    pub path: String,
    /// The raw YAML contents.
    pub content: String,
}

/// Fetches tool definition files from wherever they live. Network concerns
/// stay behind this trait.
#[async_trait]
pub trait ToolFileProvider: Send + Sync {
    async fn fetch_tool_files(&self) -> anyhow::Result<Vec<ToolFile>>;
}

/// Whether a path names a tool definition file.
pub fn is_tool_file(path: &str) -> bool {
    let name = path.rsplit('/').next().unwrap_or(path);
    VALID_TOOL_FILE_NAMES.contains(&name)
}

fn truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(flag)) => *flag,
        Some(Value::String(s)) => !s.is_empty(),
        Some(_) => true,
    }
}

/// Split a multi-document YAML string into JSON-shaped mappings.
fn parse_documents(content: &str) -> anyhow::Result<Vec<DataBlock>> {
    let mut documents = Vec::new();
    for document in serde_yaml::Deserializer::from_str(content) {
        let value = Value::deserialize(document)?;
        match value {
            Value::Object(map) => documents.push(map),
            Value::Null => {}
            other => anyhow::bail!("tool file documents must be mappings, got: {other}"),
        }
    }
    Ok(documents)
}

fn keywords_enabled(teller: &Teller) -> bool {
    teller
        .get(CONFIG_TOOLS_ALIAS)
        .map(|tell| tell.has_tag(ENABLED_TAG))
        .unwrap_or(false)
}

fn tools_tell_alias(keyword: &str) -> String {
    format!("{TOOLS_TELL_PREFIX}{keyword}")
}

/// The YAML source: parses fetched files into tool tells.
pub struct ToolYamlSource {
    info: SourceInfo,
    teller: Arc<RwLock<Teller>>,
    provider: Box<dyn ToolFileProvider>,
}

impl ToolYamlSource {
    pub fn new(
        teller: Arc<RwLock<Teller>>,
        provider: Box<dyn ToolFileProvider>,
    ) -> Result<ToolYamlSource> {
        let info = SourceInfo::new(SOURCE_ID, "Tool definition files")?
            .with_display_name("Tool Definitions");
        Ok(ToolYamlSource {
            info,
            teller,
            provider,
        })
    }

    /// Make sure the config tell and the per-keyword index tells exist.
    fn set_up_tools(teller: &mut Teller) -> Result<()> {
        let config = teller.get_or_create_tell(CONFIG_TOOLS_ALIAS, Category::Internal, SOURCE_ID)?;
        config.make_user_modified();

        if !keywords_enabled(teller) {
            log::info!("Tool keywords currently disabled.");
            return Ok(());
        }

        for (keyword, _) in TOOL_KEYWORDS {
            let tools_alias = tools_tell_alias(keyword);
            let tools_tell =
                teller.get_or_create_tell(&tools_alias, Category::Internal, SOURCE_ID)?;
            tools_tell.add_tag(keyword);
            if teller.has_tell(keyword) {
                // An existing tell by the keyword's name becomes the group
                // root for this keyword index.
                teller.add_to_group(&tools_alias, keyword)?;
            }
        }
        Ok(())
    }

    /// Promote recognized keywords from the tell's tool data into the
    /// keyword index tells.
    fn check_tool_keywords(teller: &mut Teller, alias: &str) -> Result<()> {
        if !keywords_enabled(teller) {
            return Ok(());
        }
        for (keyword, _) in TOOL_KEYWORDS {
            let datum = teller
                .get(alias)
                .ok()
                .and_then(|tell| tell.get_datum(SOURCE_ID, keyword))
                .cloned();
            if let Some(datum) = datum {
                let tools_alias = tools_tell_alias(keyword);
                let tools_tell = teller.get_mut(&tools_alias)?;
                let block_key = tools_tell.alias().to_string();
                tools_tell.update_datum_from_source(&block_key, alias, datum, None);
            }
        }
        Ok(())
    }

    /// Create or update one tell from a YAML document. Returns the alias, or
    /// `None` when the document asked to be ignored.
    fn handle_tool_document(
        teller: &mut Teller,
        raw_alias: &str,
        document: &DataBlock,
        repo_url: &str,
        category: Category,
        primary: Option<&str>,
    ) -> anyhow::Result<Option<String>> {
        if truthy(document.get(IGNORE_MARKER)) {
            log::info!("YAML entry was marked to be ignored. Skipping it.");
            return Ok(None);
        }

        let alias = {
            let tell = teller.get_or_create_tell(raw_alias, category, SOURCE_ID)?;
            tell.alias().to_string()
        };

        let mut values = document.clone();
        values.insert(PROP_ALIAS.to_string(), json!(alias));
        teller.get_mut(&alias)?.update_from_dict_representation(
            &values,
            SOURCE_ID,
            Some(SOURCE_ID),
            false,
            true,
        )?;

        if let Some(primary_alias) = primary {
            teller.add_to_group(&alias, primary_alias)?;
            let wildcard = match values.get(PROP_TAGS) {
                Some(Value::Array(tags)) => tags.iter().any(|tag| tag == "*"),
                Some(Value::String(tags)) => tags.contains('*'),
                _ => false,
            };
            if wildcard {
                let primary_tags: Vec<String> = teller
                    .get(primary_alias)?
                    .tags()
                    .iter()
                    .cloned()
                    .collect();
                teller.get_mut(&alias)?.add_tags(primary_tags);
            }
        }

        teller
            .get_mut(&alias)?
            .update_datum_from_source(SOURCE_ID, REPO_DATUM, json!(repo_url), None);

        ToolYamlSource::check_tool_keywords(teller, &alias)?;
        Ok(Some(alias))
    }

    /// Parse one file: the first document is the primary tool, the rest are
    /// related tells grouped under it.
    fn parse_tool_file(teller: &mut Teller, file: &ToolFile) -> anyhow::Result<Vec<String>> {
        log::info!("Parsing: {}/{}", file.repo_url, file.path);
        let documents = parse_documents(&file.content)?;
        let Some((primary_doc, related)) = documents.split_first() else {
            anyhow::bail!("tool file contained no documents");
        };

        if truthy(primary_doc.get(IGNORE_MARKER)) {
            log::info!(
                "Tool file at [{}/{}] is marked to be ignored with {IGNORE_MARKER}. Doing that.",
                file.repo_url,
                file.path
            );
            return Ok(Vec::new());
        }

        let primary_raw = primary_doc
            .get(PROP_ALIAS)
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow::anyhow!("primary document has no alias"))?
            .to_string();
        let Some(primary_alias) = ToolYamlSource::handle_tool_document(
            teller,
            &primary_raw,
            primary_doc,
            &file.repo_url,
            Category::Tool,
            None,
        )?
        else {
            return Ok(Vec::new());
        };

        let mut aliases = vec![primary_alias.clone()];
        for document in related {
            let Some(raw_alias) = document.get(PROP_ALIAS).and_then(Value::as_str) else {
                log::error!("Related document with no alias in {}; skipping.", file.path);
                continue;
            };
            // A leading dash expands against the primary's alias.
            let raw_alias = if let Some(suffix) = raw_alias.strip_prefix('-') {
                format!("{primary_alias}-{suffix}")
            } else {
                raw_alias.to_string()
            };
            let handled = ToolYamlSource::handle_tool_document(
                teller,
                &raw_alias,
                document,
                &file.repo_url,
                Category::ToolRelated,
                Some(&primary_alias),
            )?;
            if let Some(alias) = handled {
                aliases.push(alias);
            }
        }

        log::info!(
            "Loaded tool file for {primary_alias}. Tells added/updated: {aliases:?}"
        );
        Ok(aliases)
    }
}

#[async_trait]
impl Source for ToolYamlSource {
    fn info(&self) -> &SourceInfo {
        &self.info
    }

    fn info_mut(&mut self) -> &mut SourceInfo {
        &mut self.info
    }

    async fn load(&mut self) -> anyhow::Result<String> {
        let teller_ref = Arc::clone(&self.teller);
        let mut teller = teller_ref.write().await;

        ToolYamlSource::set_up_tools(&mut teller)?;
        log::info!("Retrieving and loading tool definition files...");
        let files = self.provider.fetch_tool_files().await?;
        log::info!("Found {} files.", files.len());

        let mut processed = 0;
        let mut failures = 0;
        for file in &files {
            if !is_tool_file(&file.path) {
                continue;
            }
            match ToolYamlSource::parse_tool_file(&mut teller, file) {
                Ok(_) => processed += 1,
                Err(error) => {
                    failures += 1;
                    log::error!(
                        "Exception hit while trying to parse tool file '{}/{}' \
                         (file not completely parsed): {error:#}",
                        file.repo_url,
                        file.path
                    );
                }
            }
        }

        teller.persist()?;
        if failures > 0 {
            Ok(format!(
                "{processed} tool files processed; {failures} could not be parsed."
            ))
        } else {
            Ok(format!("Success! {processed} tool files processed."))
        }
    }
}
