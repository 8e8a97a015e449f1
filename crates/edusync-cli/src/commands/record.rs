//! Record command handlers

use std::io::{self, IsTerminal, Write};

use anyhow::{bail, Context, Result};
use serde_json::Value;

use edusync_core::{Collection, SyncEngine};

use crate::output::Output;

type Records = Collection<Value>;

fn open(engine: &SyncEngine, collection: &str) -> Result<Records> {
    engine
        .collection::<Value>(collection)
        .with_context(|| format!("Cannot open collection '{}'", collection))
}

/// Create a record
pub fn add(engine: &SyncEngine, collection: &str, body: &str, output: &Output) -> Result<()> {
    let records = open(engine, collection)?;
    let body = parse_object(body)?;

    let id = records.create(&body).context("Failed to create record")?;
    output.success(&format!("Created {}/{}", collection, id));

    if let Some(record) = records.get(&id)? {
        output.print_record(&record);
    }
    Ok(())
}

/// Show a single record
pub fn get(engine: &SyncEngine, collection: &str, id: &str, output: &Output) -> Result<()> {
    let records = open(engine, collection)?;
    let id = resolve_id(&records, id)?;

    let record = records
        .get(&id)?
        .ok_or_else(|| anyhow::anyhow!("Record not found: {}/{}", collection, id))?;
    output.print_record(&record);
    Ok(())
}

/// List all records in a collection
pub fn list(engine: &SyncEngine, collection: &str, output: &Output) -> Result<()> {
    let records = open(engine, collection)?;
    output.print_records(&records.get_all()?);
    Ok(())
}

/// List records whose indexed field matches
pub fn query(
    engine: &SyncEngine,
    collection: &str,
    field: &str,
    value: &str,
    output: &Output,
) -> Result<()> {
    let records = open(engine, collection)?;
    let value = parse_value(value);
    output.print_records(&records.query_by(field, &value)?);
    Ok(())
}

/// Merge fields into a record
pub fn update(
    engine: &SyncEngine,
    collection: &str,
    id: &str,
    patch: &str,
    output: &Output,
) -> Result<()> {
    let records = open(engine, collection)?;
    let id = resolve_id(&records, id)?;
    let patch = parse_object(patch)?;

    let record = records
        .update(&id, &patch)
        .context("Failed to update record")?;
    output.success("Record updated");
    output.print_record(&record);
    Ok(())
}

/// Delete a record
pub fn delete(engine: &SyncEngine, collection: &str, id: &str, output: &Output) -> Result<()> {
    let records = open(engine, collection)?;
    let id = resolve_id(&records, id)?;

    // Confirm deletion
    if output.should_prompt() {
        println!("Delete record: {}/{}", collection, id);
        if !confirm("Are you sure?")? {
            println!("Cancelled.");
            return Ok(());
        }
    }

    records.delete(&id).context("Failed to delete record")?;
    output.success(&format!("Deleted {}/{}", collection, id));
    Ok(())
}

/// Resolve a record ID (supports full ID or unique prefix)
fn resolve_id(records: &Records, id: &str) -> Result<String> {
    if records.get(id)?.is_some() {
        return Ok(id.to_string());
    }

    let all = records.get_all()?;
    let matches: Vec<_> = all.iter().filter(|r| r.id.starts_with(id)).collect();

    match matches.len() {
        0 => bail!("No record in '{}' matches: {}", records.name(), id),
        1 => Ok(matches[0].id.clone()),
        _ => {
            eprintln!("Multiple records match '{}':", id);
            for record in &matches {
                eprintln!("  {}", record.id);
            }
            bail!("Ambiguous ID. Please provide more characters.");
        }
    }
}

fn parse_object(input: &str) -> Result<Value> {
    let value: Value = serde_json::from_str(input).context("Body must be valid JSON")?;
    if !value.is_object() {
        bail!("Body must be a JSON object, e.g. '{{\"name\": \"Ada\"}}'");
    }
    Ok(value)
}

/// Parse a query value as JSON, treating anything else as a plain string
fn parse_value(input: &str) -> Value {
    serde_json::from_str(input).unwrap_or_else(|_| Value::String(input.to_string()))
}

/// Ask for a yes/no confirmation; non-interactive stdin means no
fn confirm(prompt: &str) -> Result<bool> {
    if !io::stdin().is_terminal() {
        return Ok(false);
    }

    print!("{} [y/N] ", prompt);
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;

    let input = input.trim().to_lowercase();
    Ok(input == "y" || input == "yes")
}
