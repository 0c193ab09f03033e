//! Implementations of the `vk` subcommands.
//!
//! Each `run_*` function takes the process's [`Services`], performs one
//! operation, and prints a plain-text result to stdout. Errors are
//! returned to `main`, which prints them and exits non-zero.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use viking_store_core::retrieve::FindResult;
use viking_store_core::store::{AggregateRequest, TOTAL_KEY};

use crate::queue::format_status_table;
use crate::services::Services;
use crate::vfs::{FsEntry, LsOptions, SessionInfo, TreeOptions};

/// Scope roots created by `vk init`.
const INIT_ROOTS: [&str; 3] = ["viking://resources", "viking://user", "viking://agent"];

pub async fn run_init(services: &Services) -> Result<()> {
    for root in INIT_ROOTS {
        services.vfs.mkdir(root).await?;
    }
    println!(
        "Workspace initialized at {}",
        services.config.storage.workspace.display()
    );
    println!("  vector backend: {}", services.vectors.backend_name());
    println!("  collection:     {}", services.config.vectordb.collection);
    Ok(())
}

pub async fn run_write(
    services: &Services,
    uri: &str,
    file: Option<&Path>,
    text: Option<&str>,
) -> Result<()> {
    let data = match (file, text) {
        (Some(path), None) => std::fs::read(path)
            .with_context(|| format!("Failed to read {}", path.display()))?,
        (None, Some(text)) => text.as_bytes().to_vec(),
        _ => bail!("exactly one of --file or --text is required"),
    };
    services.vfs.write(uri, &data).await?;
    println!("Wrote {} bytes to {}", data.len(), uri);
    Ok(())
}

pub async fn run_read(services: &Services, uri: &str) -> Result<()> {
    let bytes = services.vfs.read(uri).await?;
    print!("{}", String::from_utf8_lossy(&bytes));
    Ok(())
}

fn print_entry(entry: &FsEntry, name: &str) {
    let kind = if entry.is_dir { "dir " } else { "file" };
    let name = if entry.is_dir {
        format!("{}/", name)
    } else {
        name.to_string()
    };
    match &entry.abstract_text {
        Some(abs) if !abs.is_empty() => {
            println!("{}  {:>8}  {:<32}  {}", kind, entry.size, name, abs.replace('\n', " "))
        }
        _ => println!("{}  {:>8}  {}", kind, entry.size, name),
    }
}

pub async fn run_ls(services: &Services, uri: &str, all: bool, with_abstract: bool) -> Result<()> {
    let entries = services
        .vfs
        .ls(
            uri,
            LsOptions {
                show_hidden: all,
                with_abstract,
                ..LsOptions::default()
            },
        )
        .await?;
    for entry in &entries {
        print_entry(entry, &entry.name);
    }
    Ok(())
}

pub async fn run_tree(services: &Services, uri: &str, all: bool, node_limit: usize) -> Result<()> {
    let entries = services
        .vfs
        .tree(
            uri,
            TreeOptions {
                show_hidden: all,
                node_limit,
                ..TreeOptions::default()
            },
        )
        .await?;
    println!("{}", uri);
    for entry in &entries {
        let depth = entry.rel_path.matches('/').count();
        println!(
            "{}{}{}",
            "  ".repeat(depth + 1),
            entry.name,
            if entry.is_dir { "/" } else { "" }
        );
    }
    Ok(())
}

pub async fn run_mkdir(services: &Services, uri: &str) -> Result<()> {
    services.vfs.mkdir(uri).await?;
    println!("Created {}", uri);
    Ok(())
}

pub async fn run_rm(services: &Services, uri: &str, recursive: bool) -> Result<()> {
    services.vfs.rm(uri, recursive).await?;
    println!("Removed {}", uri);
    Ok(())
}

pub async fn run_mv(services: &Services, from: &str, to: &str) -> Result<()> {
    services.vfs.mv(from, to).await?;
    println!("Moved {} -> {}", from, to);
    Ok(())
}

pub async fn run_stat(services: &Services, uri: &str) -> Result<()> {
    let entry = services.vfs.stat(uri).await?;
    println!("{}", serde_json::to_string_pretty(&entry)?);
    Ok(())
}

pub async fn run_grep(services: &Services, uri: &str, pattern: &str, ignore_case: bool) -> Result<()> {
    let matches = services.vfs.grep(uri, pattern, ignore_case).await?;
    for m in &matches {
        println!("{}:{}: {}", m.uri, m.line, m.content);
    }
    if matches.is_empty() {
        println!("No matches.");
    }
    Ok(())
}

pub async fn run_glob(services: &Services, pattern: &str, uri: &str, node_limit: usize) -> Result<()> {
    for found in services.vfs.glob(pattern, uri, node_limit).await? {
        println!("{}", found);
    }
    Ok(())
}

pub async fn run_abstract(services: &Services, uri: &str) -> Result<()> {
    println!("{}", services.vfs.abstract_text(uri).await?);
    Ok(())
}

pub async fn run_overview(services: &Services, uri: &str) -> Result<()> {
    println!("{}", services.vfs.overview(uri).await?);
    Ok(())
}

pub async fn run_link(services: &Services, from: &str, to: Vec<String>, reason: &str) -> Result<()> {
    let count = to.len();
    let id = services.vfs.link(from, to, reason).await?;
    println!("Linked {} uri(s) from {} as {}", count, from, id);
    Ok(())
}

pub async fn run_unlink(services: &Services, from: &str, uri: &str) -> Result<()> {
    services.vfs.unlink(from, uri).await?;
    println!("Unlinked {} from {}", uri, from);
    Ok(())
}

pub async fn run_relations(services: &Services, uri: &str) -> Result<()> {
    let relations = services.vfs.relations(uri).await?;
    if relations.is_empty() {
        println!("No relations.");
    }
    for r in &relations {
        if r.reason.is_empty() {
            println!("{}", r.uri);
        } else {
            println!("{}  ({})", r.uri, r.reason);
        }
    }
    Ok(())
}

/// Queue a semantic pass. With `wait`, run the pipeline in this process
/// until both queues are drained.
pub async fn run_reindex(
    services: &Services,
    uri: &str,
    wait: bool,
    timeout: Option<Duration>,
) -> Result<()> {
    let msg = services.vfs.reindex(uri, None).await?;
    println!("Queued semantic pass for {} ({})", msg.uri, msg.context_type.as_str());
    if !wait {
        return Ok(());
    }

    services.start().await?;
    let statuses = services.wait_indexed(timeout).await?;
    print!("{}", format_status_table(&statuses));
    if services.queues.has_errors(None) {
        bail!("indexing finished with errors");
    }
    Ok(())
}

fn print_find_result(result: &FindResult) {
    if let Some(plan) = &result.query_plan {
        println!("Query plan:");
        for q in &plan.queries {
            println!("  [{}] {}", q.context_type.as_str(), q.query);
        }
        println!();
    }
    if result.total() == 0 {
        println!("No results.");
        return;
    }
    for (label, hits) in [
        ("memories", &result.memories),
        ("resources", &result.resources),
        ("skills", &result.skills),
    ] {
        if hits.is_empty() {
            continue;
        }
        println!("{}:", label);
        for hit in hits {
            println!("  {:.4}  {}", hit.score, hit.uri);
            if !hit.abstract_text.is_empty() {
                println!("          {}", hit.abstract_text.replace('\n', " "));
            }
        }
    }
}

pub async fn run_find(
    services: &Services,
    query: &str,
    uri: Option<&str>,
    limit: usize,
    threshold: Option<f64>,
) -> Result<()> {
    let result = services.vfs.find(query, uri, limit, threshold, None).await?;
    print_find_result(&result);
    Ok(())
}

pub async fn run_search(
    services: &Services,
    query: &str,
    uri: Option<&str>,
    session_summary: Option<String>,
    recent: Vec<String>,
    limit: usize,
    threshold: Option<f64>,
) -> Result<()> {
    let session = SessionInfo {
        summary: session_summary.unwrap_or_default(),
        recent_messages: recent,
    };
    let result = services
        .vfs
        .search(query, uri, Some(&session), limit, threshold, None)
        .await?;
    print_find_result(&result);
    Ok(())
}

pub async fn run_status(services: &Services) -> Result<()> {
    let statuses = services.queues.check_status(None).await?;
    println!("Queues:");
    print!("{}", format_status_table(&statuses));

    let counts = services
        .vectors
        .aggregate(&services.config.vectordb.collection, &AggregateRequest::count())
        .await?;
    let transactions = services.txn.list_transactions().await?;
    println!();
    println!(
        "Vectors:       {} ({} backend)",
        counts.get(TOTAL_KEY).copied().unwrap_or(0),
        services.vectors.backend_name()
    );
    println!("Transactions:  {} open", transactions.len());
    Ok(())
}
