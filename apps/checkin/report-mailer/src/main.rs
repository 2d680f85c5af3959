//! Report Mailer
//!
//! Delivers the daily check-in report through whichever email provider is
//! reachable from the current platform, and escalates to operations when a
//! run fails. Can inspect providers, send a test message or run as a service.

use chrono::Utc;
use clap::{Parser, Subcommand};
use core_config::tracing::{init_tracing, install_color_eyre};
use domain_notifications::models::business_offset;
use domain_notifications::templates::TestEmailData;
use domain_notifications::{
    CronTaskSlots, DailyReportJob, EmailService, JsonFileSettingsStore, OutgoingEmail,
    ProviderRegistry, ReportFormat, ReportScheduler, ScheduleSettings, TemplateEngine,
};
use eyre::Result;
use std::sync::Arc;
use tracing::info;

mod config;
mod sources;

use config::Config;
use sources::{EmptyDataSource, JsonRowsRenderer};

#[derive(Parser)]
#[command(name = "report-mailer")]
#[command(about = "Deliver the daily check-in report with provider failover")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the providers detected from the environment, in priority order
    Providers,

    /// Connect to the best provider and print service health
    Verify,

    /// Send a test message through the active provider
    SendTest {
        /// Recipient address
        #[arg(long)]
        to: String,
    },

    /// Save the daily report schedule; a running `serve` picks it up on restart
    Schedule {
        /// Wall-clock time in UTC+8, HH:mm
        #[arg(short, long, default_value = "08:00")]
        time: String,

        /// Recipient addresses
        #[arg(long, value_delimiter = ',')]
        to: Vec<String>,

        /// Attachment format (csv, excel, zip, html)
        #[arg(short, long, default_value = "csv")]
        format: ReportFormat,

        /// Include check-in photos in the report
        #[arg(long)]
        photos: bool,

        /// Save the schedule disabled
        #[arg(long)]
        disable: bool,
    },

    /// Run the daily report once, now
    RunReport,

    /// Run the scheduler until interrupted
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    install_color_eyre();

    let config = Config::from_env()?;
    init_tracing(&config.platform);

    let cli = Cli::parse();

    match cli.command {
        Commands::Providers => {
            let registry = ProviderRegistry::new(config.mail.clone(), config.platform);
            let providers: Vec<_> = registry.detect().iter().map(|p| p.summary()).collect();
            println!("{}", serde_json::to_string_pretty(&providers)?);
        }

        Commands::Verify => {
            let service = EmailService::from_config(config.mail.clone(), config.platform)?;
            let result = service.initialize().await;
            println!("{}", serde_json::to_string_pretty(&service.health().await)?);
            let provider = result?;
            info!(provider = %provider.name, "Email provider verified");
        }

        Commands::SendTest { to } => {
            let service = EmailService::from_config(config.mail.clone(), config.platform)?;
            let provider = service.initialize().await?;

            let sent_at = Utc::now()
                .with_timezone(&business_offset())
                .format("%Y-%m-%d %H:%M:%S (UTC+8)")
                .to_string();
            let rendered = TemplateEngine::new()?.render_test(&TestEmailData {
                provider: provider.name.clone(),
                platform: format!("{:?}", config.platform),
                sent_at,
            })?;

            let outcome = service
                .send_email(OutgoingEmail::new(to, rendered.subject, rendered.html).with_text(rendered.text))
                .await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }

        Commands::Schedule {
            time,
            to,
            format,
            photos,
            disable,
        } => {
            let (scheduler, slots) = build_scheduler(&config).await?;
            scheduler
                .set_schedule(ScheduleSettings {
                    enabled: !disable,
                    recipients: to,
                    time_of_day: time,
                    report_format: format,
                    include_photos: photos,
                })
                .await?;
            println!("{}", serde_json::to_string_pretty(&scheduler.get_settings().await)?);
            slots.shutdown().await?;
        }

        Commands::RunReport => {
            let (scheduler, slots) = build_scheduler(&config).await?;
            scheduler.restore().await?;

            let summary = scheduler.execute_daily_report().await;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            slots.shutdown().await?;
        }

        Commands::Serve => {
            let (scheduler, slots) = build_scheduler(&config).await?;
            let settings = scheduler.restore().await?;
            info!(
                enabled = settings.enabled,
                time = %settings.time_of_day,
                state = %scheduler.state().await,
                "Report mailer running"
            );

            tokio::signal::ctrl_c().await?;
            info!("Shutting down");
            slots.shutdown().await?;
        }
    }

    Ok(())
}

/// Wire the scheduler against the production mail service and the settings file.
async fn build_scheduler(config: &Config) -> Result<(ReportScheduler, Arc<CronTaskSlots>)> {
    let service = EmailService::from_config(config.mail.clone(), config.platform)?;
    let job = DailyReportJob::new(
        Arc::new(service),
        Arc::new(EmptyDataSource),
        Arc::new(JsonRowsRenderer),
        config.scheduler.clone(),
    )?;

    let slots = Arc::new(CronTaskSlots::start().await?);
    let store = Arc::new(JsonFileSettingsStore::new(config.settings_path.clone()));
    let scheduler = ReportScheduler::new(job, slots.clone(), store);

    Ok((scheduler, slots))
}
