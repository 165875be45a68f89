use clap::Subcommand;
use serde_json::json;

use crate::catalog::{categories, describe_change, AppFilter, Pricing};
use crate::cli::utils::{fail, output_empty_collection, output_list, output_success};
use crate::cli::OutputFormat;
use crate::hub::Hub;
use crate::live::Snapshot;
use crate::types::AppRecord;

#[derive(Subcommand)]
pub enum AppsCommands {
    #[command(about = "List apps, newest first")]
    List {
        #[arg(long, help = "Case-insensitive match on name or developer")]
        search: Option<String>,
        #[arg(long, help = "Category id")]
        category: Option<String>,
        #[arg(long, conflicts_with = "paid", help = "Free apps only")]
        free: bool,
        #[arg(long, help = "Paid apps only")]
        paid: bool,
    },

    #[command(about = "Search app names on the server")]
    Search {
        #[arg(help = "Text to look for; % and _ match literally")]
        term: String,
    },

    #[command(about = "Show one app")]
    Show {
        #[arg(help = "App id")]
        id: String,
    },

    #[command(about = "Follow the catalog (or one app) until interrupted")]
    Watch {
        #[arg(help = "App id; omit to watch the whole catalog")]
        id: Option<String>,
    },

    #[command(about = "List store categories")]
    Categories,

    #[command(about = "Delete an app (administrators only)")]
    Delete {
        #[arg(help = "App id")]
        id: String,
    },

    #[command(about = "Count a download and print the package URL")]
    Download {
        #[arg(help = "App id")]
        id: String,
    },
}

fn summary_line(app: &AppRecord) -> String {
    format!(
        "{}  {} v{} by {} [{}] {} ({} downloads)",
        app.id,
        app.name,
        app.version,
        app.developer,
        app.category,
        app.price_label(),
        app.downloads.unwrap_or(0)
    )
}

pub async fn handle(cmd: AppsCommands, hub: &Hub, output_format: OutputFormat) -> anyhow::Result<()> {
    let catalog = &hub.catalog;
    match cmd {
        AppsCommands::List { search, category, free, paid } => {
            let apps = catalog.list_apps().await.map_err(|e| fail(&output_format, e))?;
            let pricing = if free {
                Pricing::Free
            } else if paid {
                Pricing::Paid
            } else {
                Pricing::Any
            };
            let filter = AppFilter { search, category, pricing };
            let matched: Vec<&AppRecord> = filter.apply(&apps);
            if matched.is_empty() {
                return output_empty_collection(&output_format, "apps", "No apps found");
            }
            output_list(&output_format, "apps", &matched, |app| summary_line(app))
        }
        AppsCommands::Search { term } => {
            let apps = catalog.search_apps(&term).await.map_err(|e| fail(&output_format, e))?;
            if apps.is_empty() {
                return output_empty_collection(&output_format, "apps", &format!("No apps match '{}'", term));
            }
            output_list(&output_format, "apps", &apps, summary_line)
        }
        AppsCommands::Show { id } => {
            let app = catalog.app_detail(&id).await.map_err(|e| fail(&output_format, e))?;
            let reviews = hub.reviews.reviews_for(&id).await.map_err(|e| fail(&output_format, e))?;
            let rating = crate::catalog::reviews::rating_summary(&reviews);
            match output_format {
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&json!({ "app": app, "rating": rating }))?);
                }
                OutputFormat::Text => {
                    println!("{}", summary_line(&app));
                    if let Some(description) = &app.description {
                        println!("{}", description);
                    }
                    for feature in app.features.iter().flatten() {
                        println!("  - {}", feature);
                    }
                    match rating.average {
                        Some(average) => println!("Rating: {:.1} ({} reviews)", average, rating.count),
                        None => println!("No reviews yet"),
                    }
                }
            }
            Ok(())
        }
        AppsCommands::Watch { id } => match id {
            Some(id) => watch_until_interrupted(catalog.live_app(&id).activate(), &output_format, |app| match app {
                Some(app) => summary_line(app),
                None => "(app not found)".to_string(),
            })
            .await,
            None => {
                // Admin toasts for each change, alongside the refreshed list
                let mut changes = catalog.watch_changes().await.map_err(|e| fail(&output_format, e))?;
                let text = matches!(output_format, OutputFormat::Text);
                let toasts = tokio::spawn(async move {
                    while let Some(Ok(event)) = changes.next().await {
                        if text {
                            let notice = describe_change(&event);
                            println!("* {}: {}", notice.title, notice.description.unwrap_or_default());
                        }
                    }
                });
                let result = watch_until_interrupted(catalog.live_apps().activate(), &output_format, |apps| {
                    format!("{} apps", apps.len())
                })
                .await;
                toasts.abort();
                result
            }
        },
        AppsCommands::Categories => output_list(&output_format, "categories", categories(), |c| {
            format!("{:<14} {:<18} {}", c.id, c.name, c.description)
        }),
        AppsCommands::Delete { id } => {
            catalog.delete_app(&id).await.map_err(|e| fail(&output_format, e))?;
            output_success(&output_format, &format!("Deleted app {}", id), Some(json!({ "id": id })))
        }
        AppsCommands::Download { id } => {
            let downloads = catalog.record_download(&id).await.map_err(|e| fail(&output_format, e))?;
            let app = catalog.app_detail(&id).await.map_err(|e| fail(&output_format, e))?;
            output_success(
                &output_format,
                &format!("Download {}", app.app_url.as_deref().unwrap_or("unavailable")),
                Some(json!({ "id": id, "downloads": downloads, "app_url": app.app_url })),
            )
        }
    }
}

/// Print every snapshot revision until ctrl-c
async fn watch_until_interrupted<T>(
    mut view: crate::live::LiveView<T>,
    output_format: &OutputFormat,
    line: impl Fn(&T) -> String,
) -> anyhow::Result<()>
where
    T: Clone + Send + Sync + serde::Serialize + 'static,
{
    let print = |snapshot: &Snapshot<T>| -> anyhow::Result<()> {
        let Some(data) = &snapshot.data else {
            return Ok(());
        };
        match output_format {
            OutputFormat::Json => println!("{}", serde_json::to_string(&json!({ "revision": snapshot.revision, "data": data }))?),
            OutputFormat::Text => println!("[{}] {}", snapshot.revision, line(data)),
        }
        Ok(())
    };

    print(&view.snapshot())?;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            next = view.changed() => match next {
                Some(snapshot) if !snapshot.loading => print(&snapshot)?,
                Some(_) => {}
                None => break,
            },
        }
    }
    view.deactivate().await;
    Ok(())
}
