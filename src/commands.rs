//! CLI command implementations.
//!
//! Each `run_*` function backs one `sitekeeper` subcommand and prints a
//! plain-text table to stdout. They share the service graph the HTTP server
//! uses, so the CLI and API cannot drift apart.

use anyhow::Result;
use tokio::sync::broadcast::error::TryRecvError;

use crate::deployments::Deployment;
use crate::models::ContentKind;
use crate::server::AppContext;
use crate::tracker::DeploymentEvent;

fn short(sha: &str) -> &str {
    sha.get(..7).unwrap_or(sha)
}

fn print_deployments(deployments: &[Deployment]) {
    println!("{:<9} {:<10} {:<22} ACTION", "COMMIT", "STATUS", "STARTED");
    for d in deployments {
        println!(
            "{:<9} {:<10} {:<22} {}",
            short(&d.commit_sha),
            d.status.as_str(),
            d.started_at.format("%Y-%m-%d %H:%M:%S"),
            d.action
        );
    }
}

// ============ bin ============

pub async fn run_bin_list(ctx: &AppContext) -> Result<()> {
    let items = ctx.content()?.bin.list().await?;
    if items.is_empty() {
        println!("The bin is empty.");
        return Ok(());
    }
    println!("{:<40} {:<6} BINNED AT", "NAME", "KIND");
    for item in items {
        println!(
            "{:<40} {:<6} {}",
            item.name,
            item.kind.as_str(),
            item.binned_at.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

pub async fn run_bin_move(ctx: &AppContext, kind: ContentKind, file: &str, sha: Option<&str>) -> Result<()> {
    let outcome = ctx.content()?.content.delete(kind, file, sha).await?;
    if outcome.renamed {
        println!("Moved {} to {} (renamed to avoid a collision)", file, outcome.bin_path);
    } else {
        println!("Moved {} to {}", file, outcome.bin_path);
    }
    println!("commit {}", outcome.commit_sha);
    Ok(())
}

pub async fn run_bin_restore(
    ctx: &AppContext,
    file: &str,
    sha: Option<&str>,
    kind: Option<ContentKind>,
) -> Result<()> {
    let outcome = ctx.content()?.bin.restore(file, sha, kind).await?;
    println!("Restored {} to {}", file, outcome.path);
    println!("commit {}", outcome.commit_sha);
    Ok(())
}

pub async fn run_bin_purge(ctx: &AppContext, file: &str, sha: &str) -> Result<()> {
    let outcome = ctx.content()?.bin.purge(file, sha).await?;
    println!("Purged {}", outcome.path);
    println!("commit {}", outcome.commit_sha);
    Ok(())
}

// ============ deploy ============

pub async fn run_deploy_history(ctx: &AppContext) -> Result<()> {
    let history = ctx.content()?.monitor.tracker().history().await?;
    if history.is_empty() {
        println!("No deployments recorded.");
        return Ok(());
    }
    print_deployments(&history);
    Ok(())
}

pub async fn run_deploy_status(ctx: &AppContext, sha: &str) -> Result<()> {
    match ctx.content()?.history.run_for_commit(sha).await? {
        Some(run) => {
            println!("commit:     {}", run.commit_sha);
            println!("title:      {}", run.display_title);
            println!("status:     {}", run.deployment_status());
            println!(
                "ci:         {} ({})",
                run.status,
                run.conclusion.as_deref().unwrap_or("pending")
            );
            println!("updated:    {}", run.updated_at.format("%Y-%m-%d %H:%M:%S"));
            if let Some(url) = &run.url {
                println!("url:        {}", url);
            }
        }
        None => println!("No workflow run for {} yet.", sha),
    }
    Ok(())
}

/// Pick up in-flight runs from CI and poll them until all have finished.
pub async fn run_deploy_watch(ctx: &AppContext) -> Result<()> {
    let tracker = ctx.content()?.monitor.tracker().clone();
    let mut events = tracker.subscribe();
    tracker.poll_history().await?;
    if !tracker.has_active().await {
        println!("No deployments in flight.");
        return Ok(());
    }

    let mut interval = tokio::time::interval(ctx.app_settings().poll_interval());
    loop {
        interval.tick().await;
        tracker.tick().await;
        loop {
            match events.try_recv() {
                Ok(DeploymentEvent::Started(d)) => {
                    println!("{}  started   {}", short(&d.commit_sha), d.action)
                }
                Ok(DeploymentEvent::Updated(d)) => {
                    println!("{}  {:<9} {}", short(&d.commit_sha), d.status.as_str(), d.action)
                }
                Ok(DeploymentEvent::Finished(d)) => {
                    println!("{}  {:<9} {}", short(&d.commit_sha), d.status.as_str(), d.action)
                }
                Ok(DeploymentEvent::Settled(banner)) => println!("{}", banner.message),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
        if !tracker.has_active().await {
            break;
        }
    }
    Ok(())
}

// ============ images ============

pub async fn run_images_list(ctx: &AppContext) -> Result<()> {
    let resources = ctx.media()?.images.list_resources().await?;
    println!("{:<48} {:<6} {:>11} {:>10}", "PUBLIC ID", "FORMAT", "SIZE", "BYTES");
    for r in &resources {
        println!(
            "{:<48} {:<6} {:>11} {:>10}",
            r.public_id,
            r.format,
            format!("{}x{}", r.width, r.height),
            r.bytes
        );
    }
    println!("{} images", resources.len());
    Ok(())
}

pub async fn run_images_audit(ctx: &AppContext) -> Result<()> {
    let report = ctx.auditor()?.run().await?;
    println!("posts scanned:      {}", report.posts_scanned);
    if report.unreadable_posts > 0 {
        println!("unreadable posts:   {}", report.unreadable_posts);
    }
    println!("cloudinary assets:  {}", report.cloudinary_assets);
    println!(
        "references:         {} ({} unique)",
        report.total_references, report.unique_references
    );

    if !report.missing.is_empty() {
        println!();
        println!("MISSING ({})", report.missing.len());
        for m in &report.missing {
            println!("  {}  <- {}", m.public_id, m.posts.join(", "));
        }
    }
    if !report.unused.is_empty() {
        println!();
        println!("UNUSED ({})", report.unused.len());
        for id in &report.unused {
            println!("  {}", id);
        }
    }
    Ok(())
}

pub async fn run_images_lazy_load(ctx: &AppContext, dry_run: bool) -> Result<()> {
    let report = ctx.lazy_images()?.run(dry_run).await?;
    println!("posts scanned:      {}", report.posts_scanned);
    println!("posts with images:  {}", report.posts_with_images);
    println!("already lazy:       {}", report.already_lazy);
    if report.unreadable_posts > 0 {
        println!("unreadable posts:   {}", report.unreadable_posts);
    }
    if !report.updated.is_empty() {
        println!();
        let verb = if dry_run { "WOULD UPDATE" } else { "UPDATED" };
        println!("{} ({})", verb, report.updated.len());
        for u in &report.updated {
            match &u.commit_sha {
                Some(sha) => println!("  {:<40} {:>3} images  commit {}", u.name, u.images, short(sha)),
                None => println!("  {:<40} {:>3} images", u.name, u.images),
            }
        }
    }
    if !report.failed.is_empty() {
        println!();
        println!("FAILED ({})", report.failed.len());
        for name in &report.failed {
            println!("  {}", name);
        }
        anyhow::bail!("{} post(s) could not be updated", report.failed.len());
    }
    Ok(())
}

// ============ taxonomy ============

pub async fn run_taxonomy_show(ctx: &AppContext, flat: bool) -> Result<()> {
    let doc = ctx.content()?.taxonomy.get().await?;
    if flat {
        let flat = doc.taxonomy.flatten();
        println!("categories: {}", flat.categories.join(", "));
        println!("tags:       {}", flat.tags.join(", "));
    } else {
        print!("{}", doc.taxonomy.to_yaml()?);
    }
    Ok(())
}
