use clap::Subcommand;
use serde_json::json;

use crate::catalog::reviews::rating_summary;
use crate::cli::utils::{fail, output_empty_collection, output_list, output_success};
use crate::cli::OutputFormat;
use crate::hub::Hub;

#[derive(Subcommand)]
pub enum ReviewsCommands {
    #[command(about = "List reviews for an app, newest first")]
    List {
        #[arg(help = "App id")]
        app_id: String,
    },

    #[command(about = "Write or replace your review of an app")]
    Submit {
        #[arg(help = "App id")]
        app_id: String,
        #[arg(help = "Rating from 1 to 5")]
        rating: i32,
        #[arg(help = "Review text")]
        comment: String,
    },
}

pub async fn handle(cmd: ReviewsCommands, hub: &Hub, output_format: OutputFormat) -> anyhow::Result<()> {
    match cmd {
        ReviewsCommands::List { app_id } => {
            let reviews = hub.reviews.reviews_for(&app_id).await.map_err(|e| fail(&output_format, e))?;
            if reviews.is_empty() {
                return output_empty_collection(&output_format, "reviews", "No reviews yet");
            }
            if let OutputFormat::Text = output_format {
                let summary = rating_summary(&reviews);
                if let Some(average) = summary.average {
                    println!("Average {:.1} from {} reviews", average, summary.count);
                }
            }
            output_list(&output_format, "reviews", &reviews, |r| {
                format!("{} {}  {}: {}", "★".repeat(r.rating.clamp(0, 5) as usize), r.rating, r.username, r.comment)
            })
        }
        ReviewsCommands::Submit { app_id, rating, comment } => {
            let review = hub
                .reviews
                .submit_review(&app_id, rating, &comment)
                .await
                .map_err(|e| fail(&output_format, e))?;
            output_success(&output_format, "Review submitted", Some(json!({ "review": review })))
        }
    }
}
