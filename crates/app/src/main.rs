mod command;
mod render;

use std::io::Stdout;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use deeplist_chat::{
    BlobRegistry, ChatMessage, ChatSubmissionCoordinator, CollaboratorError, Collaborators,
    Composer, DailyUsageLimiter, DirectoryUploader, LocalConversations, LocalMessageCache,
    MessageList, Notifier, PendingFile, ProviderTransport, SettingsError, SettingsStore,
    SubmissionContext, SubmitOutcome, UserIdentity,
};
use deeplist_llm::{LlmProvider, ProviderError, create_provider, fetch_models_for_provider};
use deeplist_storage::{ChatId, SqliteStorage, StorageError};
use snafu::{OptionExt, ResultExt, Snafu};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use command::{Command, HELP};
use render::{TerminalNotifier, TranscriptPrinter};

const LOG_ENV: &str = "DEEPLIST_LOG";

#[derive(Debug, Snafu)]
enum AppError {
    #[snafu(display("failed to open storage at {path:?} on `{stage}`: {source}"))]
    OpenStorage {
        stage: &'static str,
        path: PathBuf,
        source: StorageError,
    },
    #[snafu(display(
        "no API key configured on `{stage}`; set provider.api_key in {path:?} or DEEPLIST_PROVIDER__API_KEY"
    ))]
    ProviderNotConfigured { stage: &'static str, path: PathBuf },
    #[snafu(display("failed to create provider on `{stage}`: {source}"))]
    CreateProvider {
        stage: &'static str,
        source: ProviderError,
    },
    #[snafu(display("startup task failed on `{stage}`: {source}"))]
    StartupTask {
        stage: &'static str,
        source: tokio::task::JoinError,
    },
    #[snafu(display("failed to open composer on `{stage}`: {source}"))]
    OpenComposer {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("failed to read input on `{stage}`: {source}"))]
    ReadInput {
        stage: &'static str,
        source: std::io::Error,
    },
}

/// Failures of one command; reported and then the session continues.
#[derive(Debug, Snafu)]
enum CommandError {
    #[snafu(display("storage failed on `{stage}`: {source}"))]
    Storage {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("background task failed on `{stage}`: {source}"))]
    BlockingTask {
        stage: &'static str,
        source: tokio::task::JoinError,
    },
    #[snafu(display("{source}"))]
    Collaborator {
        stage: &'static str,
        source: CollaboratorError,
    },
    #[snafu(display("failed to read {path:?} on `{stage}`: {source}"))]
    ReadAttachment {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("{path:?} has no file name"))]
    AttachmentName { stage: &'static str, path: PathBuf },
    #[snafu(display("no conversation {chat_id}"))]
    UnknownConversation { stage: &'static str, chat_id: String },
    #[snafu(display("sign in to list conversations"))]
    SignedOut { stage: &'static str },
    #[snafu(display("failed to save settings on `{stage}`: {source}"))]
    SaveSettings {
        stage: &'static str,
        source: SettingsError,
    },
    #[snafu(display("failed to write output on `{stage}`: {source}"))]
    WriteOutput {
        stage: &'static str,
        source: std::io::Error,
    },
}

enum Flow {
    Continue,
    Quit,
}

struct App {
    settings: SettingsStore,
    provider: Arc<dyn LlmProvider>,
    conversations: LocalConversations,
    cache: LocalMessageCache,
    messages: MessageList,
    coordinator: ChatSubmissionCoordinator,
    printer: Arc<Mutex<TranscriptPrinter<Stdout>>>,
    context: SubmissionContext,
}

#[snafu::report]
#[tokio::main]
async fn main() -> Result<(), AppError> {
    init_tracing();

    let app = App::open(SettingsStore::load()).await?;
    app.run().await
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

impl App {
    async fn open(settings_store: SettingsStore) -> Result<Self, AppError> {
        let settings = settings_store.settings();

        let database_path = settings.database_path();
        let storage = Arc::new(
            SqliteStorage::open(&database_path.display().to_string())
                .await
                .context(OpenStorageSnafu {
                    stage: "open-storage",
                    path: database_path.clone(),
                })?,
        );
        tracing::info!(path = %database_path.display(), "storage ready");

        let provider_config =
            settings
                .provider
                .to_provider_config()
                .context(ProviderNotConfiguredSnafu {
                    stage: "resolve-provider-config",
                    path: settings_store.config_path().to_path_buf(),
                })?;
        let provider = create_provider(provider_config).context(CreateProviderSnafu {
            stage: "create-provider",
        })?;

        let notifier: Arc<dyn Notifier> = Arc::new(TerminalNotifier);
        let messages = MessageList::new();
        let conversations = LocalConversations::new(storage.clone());
        let cache = LocalMessageCache::new(storage.clone());
        let transport = ProviderTransport::new(provider.clone(), messages.clone())
            .with_cache(Arc::new(cache.clone()))
            .with_model_max_tokens(settings.provider.model_max_tokens());

        let deps = Collaborators {
            quota: Arc::new(DailyUsageLimiter::new(
                storage.clone(),
                notifier.clone(),
                settings.quota.clone(),
            )),
            conversations: Arc::new(conversations.clone()),
            uploader: Arc::new(DirectoryUploader::new(
                settings.upload_directory(),
                settings.uploads.clone(),
                notifier.clone(),
            )),
            transport: Arc::new(transport),
            message_cache: Arc::new(cache.clone()),
            drafts: storage.clone(),
            toucher: Arc::new(conversations.clone()),
            notifier,
            placeholders: Arc::new(BlobRegistry::new()),
        };

        let drafts = storage.clone();
        let composer = tokio::task::spawn_blocking(move || Composer::open(drafts, None))
            .await
            .context(StartupTaskSnafu {
                stage: "open-composer",
            })?
            .context(OpenComposerSnafu {
                stage: "open-composer",
            })?;

        let mut context = SubmissionContext::new(settings.default_model())
            .with_search(settings.chat.enable_search);
        if let Some(user) = settings.user.identity() {
            context = context.with_user(user);
        }
        if let Some(prompt) = settings.chat.custom_system_prompt.clone() {
            context = context.with_custom_system_prompt(prompt);
        }

        let coordinator = ChatSubmissionCoordinator::new(
            deps,
            composer,
            messages.clone(),
            settings.chat.max_message_length,
        );

        Ok(Self {
            settings: settings_store,
            provider,
            conversations,
            cache,
            messages,
            coordinator,
            printer: Arc::new(Mutex::new(TranscriptPrinter::new(std::io::stdout()))),
            context,
        })
    }

    async fn run(mut self) -> Result<(), AppError> {
        let watcher = self.spawn_transcript_watcher();
        println!(
            "deeplist ({} via {}). Type /help for commands.",
            self.context.model_id,
            self.provider.name()
        );

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            let Some(line) = lines.next_line().await.context(ReadInputSnafu {
                stage: "read-stdin-line",
            })?
            else {
                break;
            };

            match self.handle(Command::parse(&line)).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Quit) => break,
                Err(error) => {
                    tracing::warn!(%error, "command failed");
                    eprintln!("! {error}");
                }
            }
        }

        self.coordinator.stop();
        watcher.abort();
        Ok(())
    }

    fn spawn_transcript_watcher(&self) -> tokio::task::JoinHandle<()> {
        let mut receiver = self.messages.subscribe();
        let printer = self.printer.clone();
        tokio::spawn(async move {
            while receiver.changed().await.is_ok() {
                let snapshot = receiver.borrow_and_update().clone();
                if let Err(error) = lock(&printer).render(&snapshot) {
                    tracing::error!(%error, "failed to print transcript");
                    break;
                }
            }
        })
    }

    async fn handle(&mut self, command: Command) -> Result<Flow, CommandError> {
        match command {
            Command::Empty if self.coordinator.composer().has_pending_files() => {
                self.send(String::new()).await?
            }
            Command::Empty => {}
            Command::Send(text) => self.send(text).await?,
            Command::New => {
                self.switch_to(None, Vec::new()).await?;
                println!("* new conversation");
            }
            Command::Chats => self.list_conversations().await?,
            Command::Open(chat_id) => self.open_conversation(ChatId::new(chat_id)).await?,
            Command::Attach(path) => self.attach(&path).await?,
            Command::Suggest(text) => {
                let outcome = self
                    .coordinator
                    .handle_suggestion(&text, &self.context)
                    .await;
                log_outcome(&outcome);
            }
            Command::Reload => {
                if !self.coordinator.handle_reload(&self.context).await {
                    tracing::debug!("reload did not start");
                }
            }
            Command::Stop => self.coordinator.stop(),
            Command::Models => self.list_models().await,
            Command::Model(model_id) => self.select_model(model_id)?,
            Command::Help => println!("{HELP}"),
            Command::Invalid(reason) => eprintln!("! {reason}"),
            Command::Quit => return Ok(Flow::Quit),
        }
        Ok(Flow::Continue)
    }

    async fn send(&self, text: String) -> Result<(), CommandError> {
        let composer = self.coordinator.composer().clone();
        tokio::task::spawn_blocking(move || composer.set_input(text))
            .await
            .context(BlockingTaskSnafu {
                stage: "write-draft",
            })?
            .context(StorageSnafu {
                stage: "write-draft",
            })?;

        let outcome = self.coordinator.submit(&self.context).await;
        log_outcome(&outcome);
        Ok(())
    }

    async fn switch_to(
        &self,
        chat_id: Option<ChatId>,
        history: Vec<ChatMessage>,
    ) -> Result<(), CommandError> {
        self.coordinator.stop();

        let composer = self.coordinator.composer().clone();
        let target = chat_id.clone();
        tokio::task::spawn_blocking(move || composer.switch_conversation(target))
            .await
            .context(BlockingTaskSnafu {
                stage: "switch-conversation",
            })?
            .context(StorageSnafu {
                stage: "switch-conversation",
            })?;

        lock(&self.printer)
            .print_history(&history)
            .context(WriteOutputSnafu {
                stage: "print-history",
            })?;
        self.messages.replace(history);

        let draft = self.coordinator.composer().input();
        if !draft.trim().is_empty() {
            println!("* unsent draft: {draft}");
        }
        Ok(())
    }

    async fn open_conversation(&self, chat_id: ChatId) -> Result<(), CommandError> {
        let record = self
            .conversations
            .get(&chat_id)
            .await
            .context(CollaboratorSnafu {
                stage: "open-conversation",
            })?
            .context(UnknownConversationSnafu {
                stage: "open-conversation",
                chat_id: chat_id.to_string(),
            })?;
        let history = self.cache.load(&record.id).await.context(CollaboratorSnafu {
            stage: "load-history",
        })?;

        println!("* {} ({})", record.title, record.id);
        self.switch_to(Some(record.id), history).await
    }

    async fn list_conversations(&self) -> Result<(), CommandError> {
        let user = self.user().context(SignedOutSnafu {
            stage: "list-conversations",
        })?;
        let records = self
            .conversations
            .list(&user.id)
            .await
            .context(CollaboratorSnafu {
                stage: "list-conversations",
            })?;

        if records.is_empty() {
            println!("* no conversations yet");
        }
        let current = self.coordinator.composer().chat_id();
        for record in records {
            let marker = if current.as_ref() == Some(&record.id) {
                "*"
            } else {
                " "
            };
            println!("{marker} {}  {}", record.id, record.title);
        }
        Ok(())
    }

    async fn attach(&self, path: &Path) -> Result<(), CommandError> {
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .context(AttachmentNameSnafu {
                stage: "attach-file",
                path: path.to_path_buf(),
            })?;
        let bytes = tokio::fs::read(path).await.context(ReadAttachmentSnafu {
            stage: "attach-file",
            path: path.to_path_buf(),
        })?;
        let content_type = mime_guess::from_path(path)
            .first_or_octet_stream()
            .essence_str()
            .to_string();

        let file = PendingFile::new(name, content_type, bytes);
        println!(
            "* attached {} ({}, {} bytes)",
            file.name,
            file.content_type,
            file.size()
        );
        self.coordinator.composer().attach(file);
        Ok(())
    }

    async fn list_models(&self) {
        let (models, warning) = match fetch_models_for_provider(self.provider.as_ref()).await {
            Ok(catalog) => (catalog.models, catalog.warning),
            Err(error) => {
                tracing::warn!(%error, "failed to fetch models");
                let configured = self.settings.settings().provider.configured_models();
                (configured, Some(error.to_string()))
            }
        };

        if let Some(warning) = warning {
            eprintln!("! {warning}");
        }
        for model in models {
            let marker = if model.id == self.context.model_id {
                "*"
            } else {
                " "
            };
            println!("{marker} {}  {}", model.id, model.name);
        }
    }

    fn select_model(&mut self, model_id: String) -> Result<(), CommandError> {
        let mut settings = (*self.settings.settings()).clone();
        settings.chat.default_model = Some(model_id.clone());
        self.settings.update(settings).context(SaveSettingsSnafu {
            stage: "select-model",
        })?;
        println!("* model set to {model_id}");
        self.context.model_id = model_id;
        Ok(())
    }

    fn user(&self) -> Option<&UserIdentity> {
        self.context.user.as_ref()
    }
}

fn log_outcome(outcome: &SubmitOutcome) {
    match outcome {
        SubmitOutcome::Sent {
            chat_id,
            message_id,
        } => tracing::debug!(%chat_id, %message_id, "message handed off"),
        SubmitOutcome::RolledBack { reached, error } => {
            tracing::debug!(reached = reached.as_str(), %error, "message rolled back")
        }
        SubmitOutcome::NothingToSend | SubmitOutcome::SignInRequired => {
            tracing::debug!(phase = outcome.phase().as_str(), "nothing sent")
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
