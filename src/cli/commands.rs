//! CLI commands implementation.

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};

use crate::browser::BrowserPool;
use crate::config::Settings;
use crate::models::{
    Credentials, ExtractionSchedule, RequestedDocuments, ScheduleKind, Tenant,
};
use crate::repository::{
    init_schema, DocumentHistoryRepository, ProcessRepository, ScheduleRepository,
    SystemConfigRepository, TaskRepository, TenantRepository,
};
use crate::scrapers::ScraperRegistry;
use crate::services::{
    DocumentDownloader, LogSink, ProcessExtractor, Scheduler, TaskControl,
};
use crate::storage;
use crate::vault::CredentialVault;

#[derive(Parser)]
#[command(name = "conectasei")]
#[command(about = "Multi-tenant SEI process extraction and document archival service")]
#[command(version)]
pub struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema
    Init,

    /// Manage tenants
    Tenant {
        #[command(subcommand)]
        command: TenantCommands,
    },

    /// Manage extraction schedules
    Schedule {
        #[command(subcommand)]
        command: ScheduleCommands,
    },

    /// Run one extraction for a tenant
    Extract {
        /// Tenant id
        tenant_id: String,
    },

    /// Download documents for a process
    Download {
        /// Process id (UUID)
        process_id: String,
        /// Comma-separated document numbers (default: everything pending)
        #[arg(short, long)]
        documents: Option<String>,
    },

    /// Run the scheduler until interrupted
    Serve,

    /// Show tenants, schedules, and registered scraper versions
    Status,
}

#[derive(Subcommand)]
enum TenantCommands {
    /// Register or update a tenant
    Add {
        id: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        url: String,
        /// Upstream scraper version (e.g. 4.2.0)
        #[arg(long)]
        version: String,
    },
    /// Store upstream credentials for a tenant
    Credentials {
        id: String,
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
    },
    /// List tenants
    List,
    /// Remove a tenant and all its data
    Remove { id: String },
}

#[derive(Subcommand)]
enum ScheduleCommands {
    /// Set a tenant's schedule
    Set {
        tenant_id: String,
        /// Interval expression like "30m"
        #[arg(long, conflicts_with = "cron")]
        interval: Option<String>,
        /// Cron expression (five or six fields)
        #[arg(long)]
        cron: Option<String>,
    },
    /// Enable a tenant's schedule
    Enable { tenant_id: String },
    /// Disable a tenant's schedule
    Disable { tenant_id: String },
    /// List schedules
    List,
}

/// Everything the pipeline services need, wired once per invocation.
struct AppContext {
    settings: Settings,
    tenants: Arc<TenantRepository>,
    processes: Arc<ProcessRepository>,
    history: Arc<DocumentHistoryRepository>,
    schedules: Arc<ScheduleRepository>,
    sysconfig: Arc<SystemConfigRepository>,
    control: Arc<TaskControl>,
    registry: Arc<ScraperRegistry>,
}

impl AppContext {
    fn build(settings: Settings) -> anyhow::Result<Self> {
        let db = settings.database_path();
        init_schema(&db).context("database initialization failed")?;
        Ok(Self {
            tenants: Arc::new(TenantRepository::new(&db)?),
            processes: Arc::new(ProcessRepository::new(&db)?),
            history: Arc::new(DocumentHistoryRepository::new(&db)?),
            schedules: Arc::new(ScheduleRepository::new(&db)?),
            sysconfig: Arc::new(SystemConfigRepository::new(&db)?),
            control: Arc::new(TaskControl::new(TaskRepository::new(&db)?)),
            registry: Arc::new(ScraperRegistry::builtin()),
            settings,
        })
    }

    fn vault(&self) -> anyhow::Result<Arc<CredentialVault>> {
        let key = self.settings.require_encryption_key()?;
        Ok(Arc::new(CredentialVault::from_key_material(key)?))
    }

    async fn extractor(&self) -> anyhow::Result<Arc<ProcessExtractor>> {
        let recipients = self.sysconfig.notification_recipients()?;
        Ok(Arc::new(ProcessExtractor::new(
            self.tenants.clone(),
            self.processes.clone(),
            self.control.clone(),
            self.registry.clone(),
            Arc::new(BrowserPool::new(
                self.settings.nav_timeout,
                self.settings.browser_executable.clone(),
            )),
            self.vault()?,
            Arc::new(LogSink::new(recipients)),
            self.settings.worker_limit,
            self.settings.run_timeout,
        )))
    }

    async fn downloader(&self) -> anyhow::Result<DocumentDownloader> {
        let store = storage::shared_store(&self.settings).await;
        Ok(DocumentDownloader::new(
            self.tenants.clone(),
            self.processes.clone(),
            self.history.clone(),
            self.control.clone(),
            self.registry.clone(),
            Arc::new(BrowserPool::new(
                self.settings.nav_timeout,
                self.settings.browser_executable.clone(),
            )),
            self.vault()?,
            store,
            self.settings.run_timeout,
        ))
    }
}

pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = Settings::from_env();
    let ctx = AppContext::build(settings)?;

    match cli.command {
        Commands::Init => {
            println!("database initialized at {}", ctx.settings.database_path().display());
            Ok(())
        }
        Commands::Tenant { command } => tenant_command(&ctx, command),
        Commands::Schedule { command } => schedule_command(&ctx, command),
        Commands::Extract { tenant_id } => {
            ctx.control.startup_sweep()?;
            let extractor = ctx.extractor().await?;
            let task = extractor.run(&tenant_id).await?;
            println!("task {} finished: {}", task.id, task.status.as_str());
            if let Some(summary) = &task.result_summary {
                println!(
                    "discovered {} | new processes {} | updated {} | new documents {} | failures {}",
                    summary.discovered,
                    summary.new_processes,
                    summary.updated_processes,
                    summary.new_documents,
                    summary.failures
                );
            }
            if let Some(error) = &task.error_message {
                println!("error: {error}");
            }
            Ok(())
        }
        Commands::Download {
            process_id,
            documents,
        } => {
            ctx.control.startup_sweep()?;
            let requested = match documents {
                Some(list) => RequestedDocuments::Subset(
                    list.split(',').map(|s| s.trim().to_string()).collect(),
                ),
                None => RequestedDocuments::All,
            };
            let downloader = ctx.downloader().await?;
            let task = downloader.run(&process_id, requested).await?;
            println!("task {} finished: {}", task.id, task.status.as_str());
            for (number, outcome) in &task.results {
                let detail = outcome.reason.as_deref().unwrap_or("ok");
                println!(
                    "  {number}: uploaded={} ({detail})",
                    outcome.uploaded
                );
            }
            Ok(())
        }
        Commands::Serve => serve(&ctx).await,
        Commands::Status => status(&ctx),
    }
}

fn tenant_command(ctx: &AppContext, command: TenantCommands) -> anyhow::Result<()> {
    match command {
        TenantCommands::Add {
            id,
            name,
            url,
            version,
        } => {
            if !ctx.registry.contains(&version) {
                anyhow::bail!(
                    "scraper version {version} is not registered (known: {})",
                    ctx.registry.versions().join(", ")
                );
            }
            url::Url::parse(&url).with_context(|| format!("invalid upstream URL: {url}"))?;
            let mut tenant = Tenant::new(&id, &name, &url, &version);
            if let Some(existing) = ctx.tenants.get(&id)? {
                tenant.encrypted_credentials = existing.encrypted_credentials;
                tenant.created_at = existing.created_at;
                tenant.extra_metadata = existing.extra_metadata;
            }
            ctx.tenants.save(&tenant)?;
            println!("tenant {id} saved");
            Ok(())
        }
        TenantCommands::Credentials { id, email, password } => {
            ctx.tenants
                .get(&id)?
                .with_context(|| format!("tenant {id} not found"))?;
            let vault = ctx.vault()?;
            let encrypted = vault.encrypt_credentials(&Credentials { email, password })?;
            ctx.tenants.set_credentials(&id, &encrypted)?;
            println!("credentials stored for tenant {id}");
            Ok(())
        }
        TenantCommands::List => {
            for tenant in ctx.tenants.get_all()? {
                println!(
                    "{}  {}  {}  scraper={}  active={}",
                    tenant.id, tenant.name, tenant.upstream_url, tenant.scraper_version,
                    tenant.is_active
                );
            }
            Ok(())
        }
        TenantCommands::Remove { id } => {
            if ctx.tenants.delete(&id)? {
                println!("tenant {id} removed");
            } else {
                println!("tenant {id} not found");
            }
            Ok(())
        }
    }
}

fn schedule_command(ctx: &AppContext, command: ScheduleCommands) -> anyhow::Result<()> {
    match command {
        ScheduleCommands::Set {
            tenant_id,
            interval,
            cron,
        } => {
            let (kind, expression) = match (interval, cron) {
                (Some(expr), None) => (ScheduleKind::Interval, expr),
                (None, Some(expr)) => (ScheduleKind::Cron, expr),
                _ => anyhow::bail!("exactly one of --interval or --cron is required"),
            };
            ctx.tenants
                .get(&tenant_id)?
                .with_context(|| format!("tenant {tenant_id} not found"))?;
            ctx.schedules.upsert(&ExtractionSchedule {
                tenant_id: tenant_id.clone(),
                kind,
                expression,
                is_active: true,
            })?;
            println!("schedule set for tenant {tenant_id}");
            Ok(())
        }
        ScheduleCommands::Enable { tenant_id } => {
            if ctx.schedules.set_active(&tenant_id, true)? {
                println!("schedule enabled for tenant {tenant_id}");
            } else {
                println!("tenant {tenant_id} has no schedule");
            }
            Ok(())
        }
        ScheduleCommands::Disable { tenant_id } => {
            if ctx.schedules.set_active(&tenant_id, false)? {
                println!("schedule disabled for tenant {tenant_id}");
            } else {
                println!("tenant {tenant_id} has no schedule");
            }
            Ok(())
        }
        ScheduleCommands::List => {
            for schedule in ctx.schedules.get_all_active()? {
                println!(
                    "{}  {}  {}",
                    schedule.tenant_id,
                    schedule.kind.as_str(),
                    schedule.expression
                );
            }
            Ok(())
        }
    }
}

async fn serve(ctx: &AppContext) -> anyhow::Result<()> {
    ctx.control.startup_sweep()?;
    let extractor = ctx.extractor().await?;

    let scheduler = Arc::new(Scheduler::new(
        ctx.schedules.clone(),
        ctx.tenants.clone(),
        extractor,
        ctx.control.clone(),
        ctx.settings.shutdown_grace,
    ));
    scheduler.load_jobs()?;

    let runner = tokio::spawn(scheduler.clone().run());

    tokio::signal::ctrl_c()
        .await
        .context("could not install interrupt handler")?;
    println!("shutting down, draining in-flight runs");
    scheduler.shutdown();
    let _ = runner.await;
    Ok(())
}

fn status(ctx: &AppContext) -> anyhow::Result<()> {
    println!("scraper versions: {}", ctx.registry.versions().join(", "));
    println!(
        "object store configured: {}",
        ctx.settings.object_store_configured()
    );

    for tenant in ctx.tenants.get_all()? {
        let processes = ctx.processes.get_all_by_tenant(&tenant.id)?;
        let schedule = ctx
            .schedules
            .get(&tenant.id)?
            .map(|s| format!("{} {} (active={})", s.kind.as_str(), s.expression, s.is_active))
            .unwrap_or_else(|| "none".to_string());
        println!(
            "{}: {} processes, schedule: {}, active={}",
            tenant.id,
            processes.len(),
            schedule,
            tenant.is_active
        );
    }
    Ok(())
}
