use std::env::current_dir;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Error};
use console::{Term, style};
use dialoguer::{Input, Select, theme::ColorfulTheme};
use tokio::sync::mpsc;
use tracing::{error, info, trace, warn};

use crate::pexels::config_loader::API_KEY_ENV;
use crate::pexels::tui::{SessionView, status_line};
use crate::pexels::{
    ConfigManager, CoordinatorError, DedupStore, DownloadCoordinator, EventReceiver, PexelsClient,
    Quality, SessionEvent, SessionSummary, parse_categories, parse_count,
};

/// The name of the cargo package.
const NAME: &str = env!("CARGO_PKG_NAME");

/// The version of the cargo package.
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The authors who created the package.
const AUTHORS: &str = env!("CARGO_PKG_AUTHORS");

#[derive(Debug, Clone, Copy)]
enum MainMenuOption {
    StartDownload,
    Exit,
}

impl MainMenuOption {
    fn variants() -> &'static [MainMenuOption] {
        &[MainMenuOption::StartDownload, MainMenuOption::Exit]
    }

    fn display_name(&self) -> &'static str {
        match self {
            MainMenuOption::StartDownload => "Start a download",
            MainMenuOption::Exit => "Exit",
        }
    }
}

/// Exit code used when Ctrl-C ends the program outside a download.
const INTERRUPTED_EXIT_CODE: i32 = 130;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InterruptAction {
    /// Forwarded to the running session, which winds down.
    StopSession,
    /// No session is running, so the program ends.
    Exit,
}

/// Decides what a Ctrl-C means.
///
/// Once tokio listens for SIGINT the default handler is gone for the rest of the process, so
/// every interrupt goes through here: during a download it stops the session, otherwise it
/// ends the program like the default handler would.
struct InterruptRouter {
    in_session: AtomicBool,
    tx: mpsc::UnboundedSender<()>,
}

impl InterruptRouter {
    fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let router = Arc::new(Self {
            in_session: AtomicBool::new(false),
            tx,
        });
        (router, rx)
    }

    fn set_in_session(&self, active: bool) {
        self.in_session.store(active, Ordering::SeqCst);
    }

    fn route(&self) -> InterruptAction {
        if self.in_session.load(Ordering::SeqCst) && self.tx.send(()).is_ok() {
            InterruptAction::StopSession
        } else {
            InterruptAction::Exit
        }
    }

    /// Listens for Ctrl-C for the rest of the process.
    fn listen(self: Arc<Self>) {
        tokio::spawn(async move {
            loop {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!("Failed to listen for Ctrl-C: {}", e);
                    return;
                }
                if self.route() == InterruptAction::Exit {
                    info!("Interrupted, exiting...");
                    let _ = Term::stdout().show_cursor();
                    std::process::exit(INTERRUPTED_EXIT_CODE);
                }
            }
        });
    }
}

/// A program class that handles the flow of the downloader user experience and steps of execution.
pub(crate) struct Program {
    config_manager: ConfigManager,
    theme: ColorfulTheme,
}

impl Program {
    pub(crate) fn new(config_manager: ConfigManager) -> Self {
        Self {
            config_manager,
            theme: ColorfulTheme::default(),
        }
    }

    /// Runs the downloader program.
    pub(crate) async fn run(&self) -> Result<(), Error> {
        Term::stdout().set_title("Pexels downloader");
        trace!("Starting Pexels downloader...");
        trace!("Program Name: {}", NAME);
        trace!("Program Version: {}", VERSION);
        trace!("Program Authors: {}", AUTHORS);
        let working_dir = current_dir().context("Failed to get working directory")?;
        trace!("Program Working Directory: {}", working_dir.display());

        // Nothing can be downloaded without a key, so refuse before building anything.
        if !self.config_manager.has_valid_api_key() {
            error!("No Pexels API key configured");
            println!(
                "{}",
                style(format!(
                    "Please set your Pexels API key in {} or the {} environment variable.",
                    self.config_manager.config_path().display(),
                    API_KEY_ENV
                ))
                .red()
                .bold()
            );
            return Ok(());
        }

        let config = self.config_manager.get_app_config()?;
        let source = Arc::new(PexelsClient::from_config(&config)?);
        let dedup = Arc::new(DedupStore::load(
            &config.output_directory(),
            config.download_log_path(),
        ));
        let (coordinator, mut events) = DownloadCoordinator::from_config(source, dedup, &config);
        print_pending(&mut events);

        let (interrupts, mut interrupt_rx) = InterruptRouter::new();
        interrupts.clone().listen();

        loop {
            match self.show_main_menu()? {
                MainMenuOption::StartDownload => {
                    self.download(&coordinator, &mut events, &interrupts, &mut interrupt_rx)
                        .await?;
                }
                MainMenuOption::Exit => {
                    info!("Exiting at user request...");
                    break;
                }
            }
        }

        Ok(())
    }

    fn show_main_menu(&self) -> Result<MainMenuOption, Error> {
        let options = MainMenuOption::variants();
        let option_names: Vec<&str> = options.iter().map(|o| o.display_name()).collect();

        println!("\n{}", style("Pexels Downloader").cyan().bold());

        let selection = Select::with_theme(&self.theme)
            .items(&option_names)
            .default(0)
            .interact()?;

        Ok(options[selection])
    }

    /// Asks for one request, runs it and prints the per-category summary.
    async fn download(
        &self,
        coordinator: &DownloadCoordinator<PexelsClient>,
        events: &mut EventReceiver,
        interrupts: &InterruptRouter,
        interrupt_rx: &mut mpsc::UnboundedReceiver<()>,
    ) -> Result<(), Error> {
        let categories: String = Input::with_theme(&self.theme)
            .with_prompt("Categories (comma separated)")
            .allow_empty(true)
            .interact_text()?;
        let categories = parse_categories(&categories);

        let count: String = Input::with_theme(&self.theme)
            .with_prompt(format!(
                "Images per category (max {})",
                coordinator.limits().max_images_per_category
            ))
            .default("30".to_string())
            .interact_text()?;
        let count = match parse_count(&count) {
            Ok(count) => count,
            Err(e) => {
                println!("{}", style(e).red().bold());
                return Ok(());
            }
        };

        let qualities = Quality::variants();
        let selection = Select::with_theme(&self.theme)
            .with_prompt("Image quality")
            .items(qualities)
            .default(qualities.iter().position(|q| *q == Quality::default()).unwrap_or(0))
            .interact()?;
        let quality = qualities[selection];

        let handle = match coordinator.start(categories.clone(), count, quality) {
            Ok(handle) => handle,
            Err(CoordinatorError::Validation(_)) => {
                // The coordinator already reported the reason.
                print_pending(events);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        info!(session = %handle.id(), "Session started");

        while interrupt_rx.try_recv().is_ok() {}
        interrupts.set_in_session(true);

        let view = SessionView::new(&categories, count);
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => {
                        if view.apply(&event).is_some() {
                            break;
                        }
                    }
                    None => break,
                },
                Some(()) = interrupt_rx.recv() => coordinator.stop(),
            }
        }
        interrupts.set_in_session(false);

        let summary = handle.wait().await?;
        print_summary(&summary);

        Ok(())
    }
}

/// Prints status lines queued while no session view was active.
fn print_pending(events: &mut EventReceiver) {
    while let Ok(event) = events.try_recv() {
        if let SessionEvent::Status { level, category, message } = event {
            println!("{}", status_line(level, category.as_deref(), &message));
        }
    }
}

fn print_summary(summary: &SessionSummary) {
    println!(
        "\n{} ({})",
        style(format!("Session {}", summary.reason)).cyan().bold(),
        summary.id
    );
    for report in &summary.reports {
        let line = format!(
            "  {}: {}/{} images, {}",
            report.category, report.downloaded, report.target, report.status
        );
        match &report.folder {
            Some(folder) => println!("{} -> {}", line, folder.display()),
            None => println!("{}", line),
        }
    }
    println!("Downloaded {} images in total.", summary.total_downloaded());
}
