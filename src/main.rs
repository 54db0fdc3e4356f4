use formula_bar::api::{
    ApiClient, ConversationIntent, ConversationResponse, ConversationSummary, FormulationResponse,
    QueryValidation, Role,
};
use formula_bar::config::{Config, Endpoints, UiConfig};
use formula_bar::conversation::{self, Conversation, Outbound};
use formula_bar::formulation::{GenerationState, FUNDAMENTALS};
use formula_bar::status::{HideRequest, StatusBoard, StatusListener, StatusOutcome, StatusUpdate, StreamEnd};

use iced::futures::{channel::mpsc, future, SinkExt};
use iced::{
    widget::{button, column, container, progress_bar, row, scrollable, text, text_input, text_input::Id, Column},
    Element, Length, Task, Theme, Font, Subscription,
    time, clipboard,
    keyboard::{self, Key},
    event::{self, Event as IcedEvent},
    alignment, Padding,
    window::{self, Level},
};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const SPINNER_FRAMES: [&str; 10] = ["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];

fn main() -> iced::Result {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "formula_bar=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load();
    tracing::info!("Formulation API: {}", config.api.base_url);

    let window_settings = window::Settings {
        size: iced::Size::new(config.window.width as f32, config.window.height as f32),
        min_size: Some(iced::Size::new(
            config.window.min_width as f32,
            config.window.min_height as f32,
        )),
        position: window::Position::Centered,
        ..Default::default()
    };

    iced::application("Formula Bar", App::update, App::view)
        .theme(App::theme)
        .subscription(App::subscription)
        .window(window_settings)
        .default_font(Font::MONOSPACE)
        .run_with(move || App::new(config))
}

#[derive(Debug, Clone)]
enum Message {
    InputChanged(String),
    Submit,
    ConversationReplied(Result<ConversationResponse, String>),
    RequestSummary,
    SummaryReceived(Result<ConversationSummary, String>),
    IntentReceived(Result<ConversationIntent, String>),
    CopyEnhanced,
    CheckRequest,
    CheckReceived(Result<(QueryValidation, Vec<String>), String>),
    Generate,
    Generated(Result<FormulationResponse, String>),
    Status(u64, StatusUpdate),
    StatusClosed(u64, StreamEnd),
    HideStatus(u64),
    RotateStatus,
    Tick,
    Exit,
}

/// The progress feed of the generation currently running.
struct StatusStream {
    attempt: u64,
    query: String,
    cancel: CancellationToken,
}

struct App {
    client: ApiClient,
    ui: UiConfig,
    input_text: String,
    input_id: Id,
    conversation: Conversation,
    summary: Option<ConversationSummary>,
    intent: Option<ConversationIntent>,
    check: Option<(QueryValidation, Vec<String>)>,
    checking: bool,
    generation: GenerationState,
    status: StatusBoard,
    status_stream: Option<StatusStream>,
    loading_frame: usize,
}

impl App {
    fn new(config: Config) -> (Self, Task<Message>) {
        let client = ApiClient::new(Endpoints::from(&config.api));
        let input_id = Id::unique();
        let status = StatusBoard::new(Duration::from_millis(config.ui.status_hide_delay_ms));

        let app = App {
            client,
            ui: config.ui,
            input_text: String::new(),
            input_id: input_id.clone(),
            conversation: Conversation::new(),
            summary: None,
            intent: None,
            check: None,
            checking: false,
            generation: GenerationState::default(),
            status,
            status_stream: None,
            loading_frame: 0,
        };

        let focus_task = text_input::focus(input_id);
        let window_task = window::get_latest()
            .and_then(|id| window::change_level(id, Level::AlwaysOnTop));

        (app, Task::batch([focus_task, window_task]))
    }

    fn update(&mut self, message: Message) -> Task<Message> {
        match message {
            Message::InputChanged(value) => {
                self.input_text = value;
                Task::none()
            }
            Message::Submit => {
                let Some(outbound) = self.conversation.submit(&self.input_text) else {
                    return Task::none();
                };
                self.input_text.clear();

                let client = self.client.clone();
                Task::future(async move {
                    let result = match outbound {
                        Outbound::Start { initial_query } => {
                            client.start_conversation(&initial_query).await
                        }
                        Outbound::Continue { conversation_id, user_response, history } => {
                            client
                                .continue_conversation(&conversation_id, &user_response, &history)
                                .await
                        }
                    };
                    Message::ConversationReplied(result.map_err(|e| e.to_string()))
                })
            }
            Message::ConversationReplied(Ok(response)) => {
                self.summary = None;
                match self.conversation.apply(response) {
                    Some(enhanced_query) => self.on_formulation_ready(enhanced_query),
                    None => text_input::focus(self.input_id.clone()),
                }
            }
            Message::ConversationReplied(Err(error)) => {
                tracing::error!("Error in conversation: {}", error);
                self.conversation.fail();
                Task::none()
            }
            Message::RequestSummary => {
                if self.conversation.is_empty() || self.conversation.is_complete() {
                    return Task::none();
                }
                let client = self.client.clone();
                let history = self.conversation.history_snapshot();
                Task::future(async move {
                    let result = client.conversation_summary(&history).await;
                    Message::SummaryReceived(result.map_err(|e| e.to_string()))
                })
            }
            Message::SummaryReceived(result) => {
                match result {
                    Ok(summary) => self.summary = Some(summary),
                    Err(error) => tracing::error!("Error fetching conversation summary: {}", error),
                }
                Task::none()
            }
            Message::IntentReceived(result) => {
                match result {
                    Ok(intent) => self.intent = Some(intent),
                    Err(error) => tracing::error!("Error aggregating conversation intent: {}", error),
                }
                Task::none()
            }
            Message::CopyEnhanced => match self.conversation.enhanced_query() {
                Some(query) => clipboard::write(query.to_string()),
                None => Task::none(),
            },
            Message::CheckRequest => {
                let Some(query) = self.ready_query() else {
                    return Task::none();
                };
                if self.checking {
                    return Task::none();
                }
                self.checking = true;

                let client = self.client.clone();
                Task::future(async move {
                    let result = async {
                        let validation = client.validate_query(&query).await?;
                        let suggestions = if validation.is_sufficient {
                            Vec::new()
                        } else {
                            client.query_suggestions(&query).await?
                        };
                        Ok::<_, formula_bar::api::ApiError>((validation, suggestions))
                    }
                    .await;
                    Message::CheckReceived(result.map_err(|e| e.to_string()))
                })
            }
            Message::CheckReceived(result) => {
                self.checking = false;
                match result {
                    Ok(check) => self.check = Some(check),
                    Err(error) => tracing::error!("Query validation failed: {}", error),
                }
                Task::none()
            }
            Message::Generate => {
                let Some(query) = self.ready_query() else {
                    return Task::none();
                };
                if !self.generation.begin() {
                    return Task::none();
                }

                let attempt = self.status.begin();
                if let Some(previous) = self.status_stream.take() {
                    previous.cancel.cancel();
                }
                self.status_stream = Some(StatusStream {
                    attempt,
                    query: query.clone(),
                    cancel: CancellationToken::new(),
                });

                let client = self.client.clone();
                Task::future(async move {
                    let result = client.generate_formulation(&query).await;
                    Message::Generated(result.map_err(|e| e.to_string()))
                })
            }
            Message::Generated(result) => {
                match result {
                    Ok(formulation) => {
                        tracing::info!("received {} ingredients", formulation.ingredients.len());
                        self.generation.succeed(formulation);
                    }
                    Err(error) => {
                        tracing::error!("Error generating formulation: {}", error);
                        self.generation.fail(format!("Failed to generate formulation: {}", error));
                    }
                }
                Self::schedule_hide(self.status.hide_request())
            }
            Message::Status(attempt, update) => {
                if attempt != self.status.attempt() {
                    return Task::none();
                }
                match update {
                    StatusUpdate::Event(event) => {
                        if let StatusOutcome::Done(hide) = self.status.apply(event) {
                            self.close_status_stream();
                            return Self::schedule_hide(hide);
                        }
                    }
                    // Already logged by the listener; the display keeps its last value.
                    StatusUpdate::Malformed(_) | StatusUpdate::TransportError(_) => {}
                }
                Task::none()
            }
            Message::StatusClosed(attempt, end) => {
                tracing::debug!("status stream {} ended: {:?}", attempt, end);
                if self.status_stream.as_ref().map(|s| s.attempt) == Some(attempt) {
                    self.status_stream = None;
                }
                Task::none()
            }
            Message::HideStatus(attempt) => {
                self.status.hide(attempt);
                Task::none()
            }
            Message::RotateStatus => {
                self.status.rotate();
                Task::none()
            }
            Message::Tick => {
                self.loading_frame = (self.loading_frame + 1) % SPINNER_FRAMES.len();
                Task::none()
            }
            Message::Exit => {
                self.close_status_stream();
                iced::exit()
            }
        }
    }

    /// One-shot hand-off from the conversation: the request is settled.
    fn on_formulation_ready(&mut self, enhanced_query: String) -> Task<Message> {
        tracing::info!("enhanced query ready ({} chars)", enhanced_query.len());
        self.check = None;

        let client = self.client.clone();
        let history = self.conversation.history_snapshot();
        Task::future(async move {
            let result = client.aggregate_intent(&history).await;
            Message::IntentReceived(result.map_err(|e| e.to_string()))
        })
    }

    fn ready_query(&self) -> Option<String> {
        self.conversation
            .enhanced_query()
            .filter(|q| !q.is_empty())
            .map(str::to_string)
    }

    fn close_status_stream(&mut self) {
        if let Some(stream) = self.status_stream.take() {
            stream.cancel.cancel();
        }
    }

    fn schedule_hide(hide: HideRequest) -> Task<Message> {
        Task::perform(hide.wait(), Message::HideStatus)
    }

    fn subscription(&self) -> Subscription<Message> {
        let busy = self.conversation.in_flight() || self.generation.is_generating();
        let spinner = if busy {
            time::every(Duration::from_millis(80)).map(|_| Message::Tick)
        } else {
            Subscription::none()
        };

        let rotation = if self.generation.is_generating() && self.status.is_visible() {
            time::every(Duration::from_millis(self.ui.status_rotate_ms)).map(|_| Message::RotateStatus)
        } else {
            Subscription::none()
        };

        let feed = match &self.status_stream {
            Some(stream) => status_feed(self.client.clone(), stream),
            None => Subscription::none(),
        };

        let events = event::listen_with(|event, _status, _id| {
            if let IcedEvent::Keyboard(keyboard::Event::KeyPressed {
                key: Key::Named(keyboard::key::Named::Escape),
                ..
            }) = event
            {
                Some(Message::Exit)
            } else {
                None
            }
        });

        Subscription::batch([spinner, rotation, feed, events])
    }

    fn view(&self) -> Element<Message> {
        let mut content = Column::new().spacing(14).padding(10);

        content = content.push(self.chat_view());

        if let Some(query) = self.conversation.enhanced_query().filter(|q| !q.is_empty()) {
            content = content.push(self.enhanced_view(query));
        }

        if self.status.is_visible() {
            let spinner = if self.generation.is_generating() {
                SPINNER_FRAMES[self.loading_frame]
            } else {
                "✓"
            };
            content = content.push(
                container(row![text(spinner).size(18), text(self.status.text()).size(15)].spacing(10))
                    .padding(10)
                    .width(Length::Fill)
                    .style(container::rounded_box),
            );
        }

        if let Some(error) = self.generation.error() {
            content = content.push(text(error).size(15).style(text::danger));
        }

        if let Some(result) = self.generation.result() {
            content = content.push(self.results_view(result));
        }

        scrollable(content).height(Length::Fill).into()
    }

    fn chat_view(&self) -> Element<Message> {
        let mut chat = Column::new().spacing(8);

        if self.conversation.is_empty() {
            chat = chat.push(text("Let's create your perfect formulation!").size(20));
            chat = chat.push(text(
                "Tell me what you'd like to create, and I'll guide you through the process step by step.",
            ));
            chat = chat.push(text("I'll ask 3-4 focused questions to understand your needs.").size(13));
        }

        for message in self.conversation.visible_messages() {
            let (label, align) = match message.role {
                Role::User => ("You", alignment::Horizontal::Right),
                _ => ("Assistant", alignment::Horizontal::Left),
            };
            chat = chat.push(
                container(column![text(label).size(12), text(message.content.as_str()).size(15)].spacing(4))
                    .padding(10)
                    .width(Length::Fill)
                    .align_x(align)
                    .style(container::rounded_box),
            );
        }

        if self.conversation.in_flight() {
            chat = chat.push(text(format!("{} ...", SPINNER_FRAMES[self.loading_frame])).size(18));
        }

        if !self.conversation.is_empty() && !self.conversation.is_complete() {
            let count = self.conversation.exchange_count();
            chat = chat.push(
                progress_bar(
                    0.0..=1.0,
                    conversation::progress_fraction(count, self.ui.expected_exchanges),
                )
                .height(Length::Fixed(6.0)),
            );
            chat = chat.push(
                row![
                    text(format!("Exchange {}/{}", count, self.ui.expected_exchanges)).size(13),
                    text(conversation::progress_label(count)).size(13),
                    button(text("[Summary]").size(13)).on_press(Message::RequestSummary).padding(4),
                ]
                .spacing(12),
            );

            if let Some(summary) = &self.summary {
                chat = chat.push(summary_view(summary));
            }
        }

        if self.conversation.accepts_input() {
            let placeholder = if self.conversation.is_empty() {
                "Tell me what you'd like to create..."
            } else {
                "Type your response..."
            };
            let mut input = text_input(placeholder, &self.input_text)
                .padding(15)
                .size(18)
                .id(self.input_id.clone());
            if !self.conversation.in_flight() {
                input = input
                    .on_input(Message::InputChanged)
                    .on_submit(Message::Submit);
            }
            chat = chat.push(input);
        }

        chat.into()
    }

    fn enhanced_view<'a>(&'a self, query: &'a str) -> Element<'a, Message> {
        let mut panel = Column::new().spacing(10);

        panel = panel.push(text("What we understood..").size(20));
        panel = panel.push(text("Based on our conversation, here's your complete formulation request:").size(13));
        panel = panel.push(
            container(text(query).size(15))
                .padding(12)
                .width(Length::Fill)
                .style(container::rounded_box),
        );

        let generate_label = if self.generation.is_generating() {
            format!("{} Generating Formulation...", SPINNER_FRAMES[self.loading_frame])
        } else {
            "Generate Formulation".to_string()
        };

        panel = panel.push(
            row![
                button(text(generate_label))
                    .on_press_maybe((!self.generation.is_generating()).then_some(Message::Generate))
                    .padding(10),
                button(text("[Check request]").size(14))
                    .on_press_maybe((!self.checking).then_some(Message::CheckRequest))
                    .padding(10),
                button(text("[Copy]").size(14)).on_press(Message::CopyEnhanced).padding(10),
            ]
            .spacing(10),
        );

        if let Some(intent) = &self.intent {
            panel = panel.push(intent_view(intent));
        }

        if let Some((validation, suggestions)) = &self.check {
            panel = panel.push(check_view(validation, suggestions));
        }

        container(panel)
            .padding(Padding::from([10, 0]))
            .width(Length::Fill)
            .into()
    }

    fn results_view<'a>(&'a self, result: &'a FormulationResponse) -> Element<'a, Message> {
        let mut results = Column::new().spacing(10);

        results = results.push(text("Your Natural Formulation").size(20));
        if !result.original_query.is_empty() {
            results = results.push(text(format!("Original query: {}", result.original_query)).size(13));
        }
        if !result.enhanced_query.is_empty() {
            results = results.push(text(format!("Enhanced query: {}", result.enhanced_query)).size(13));
        }

        results = results.push(text("Formulation Fundamentals").size(17));
        results = results.push(text("Every natural formulation consists of these essential components:").size(13));
        for fundamental in FUNDAMENTALS.iter() {
            results = results.push(
                container(
                    column![
                        text(fundamental.title).size(15),
                        text(fundamental.description).size(13),
                        text(format!("Examples: {}", fundamental.examples)).size(13),
                    ]
                    .spacing(2),
                )
                .padding(8)
                .width(Length::Fill)
                .style(container::bordered_box),
            );
        }

        results = results.push(text("Recommended Ingredients").size(17));
        let shown = self.generation.shown_ingredients(self.ui.max_ingredients);
        if shown.is_empty() {
            results = results.push(text("No ingredients were returned for this request.").size(13));
        }
        for ingredient in shown {
            let mut card = Column::new().spacing(2).push(text(ingredient.name.as_str()).size(16));
            for (label, value) in ingredient.detail_lines() {
                card = card.push(text(format!("{}: {}", label, value)).size(13));
            }
            results = results.push(
                container(card)
                    .padding(8)
                    .width(Length::Fill)
                    .style(container::rounded_box),
            );
        }

        let missing = result.missing_context();
        if !missing.is_empty() {
            results = results.push(text(format!("Missing context: {}", missing.join(", "))).size(13));
        }
        let improvements = result.suggested_improvements();
        if !improvements.is_empty() {
            results = results.push(text(format!("Could be improved by: {}", improvements.join(", "))).size(13));
        }

        results.into()
    }

    fn theme(&self) -> Theme {
        Theme::TokyoNight
    }
}

/// Runs the progress listener for one generation as a subscription, keyed by
/// attempt so a new generation replaces the old connection.
fn status_feed(client: ApiClient, stream: &StatusStream) -> Subscription<Message> {
    let attempt = stream.attempt;
    let listener = StatusListener::new(client, stream.query.clone(), stream.cancel.clone());

    Subscription::run_with_id(
        ("formulation-status", attempt),
        iced::stream::channel(32, move |mut output| async move {
            let updates = output
                .clone()
                .with(move |update: StatusUpdate| future::ready(Ok::<_, mpsc::SendError>(Message::Status(attempt, update))));
            let end = listener.run(updates).await;
            if output.send(Message::StatusClosed(attempt, end)).await.is_err() {
                tracing::debug!("status stream {} closed after the shell stopped listening", attempt);
            }
        }),
    )
}

fn summary_view(summary: &ConversationSummary) -> Element<Message> {
    let mut view = Column::new().spacing(4);
    view = view.push(text(format!(
        "So far ({:.0}% complete, confidence {:.0}%):",
        summary.progress_percentage,
        summary.confidence_score * 100.0
    )).size(13));
    view = view.push(text(summary.current_understanding.as_str()).size(14));
    if !summary.missing_information.is_empty() {
        view = view.push(text(format!("Still missing: {}", summary.missing_information.join(", "))).size(13));
    }
    for suggestion in &summary.suggestions {
        view = view.push(text(format!("• {}", suggestion)).size(13));
    }
    container(view)
        .padding(8)
        .width(Length::Fill)
        .style(container::bordered_box)
        .into()
}

fn intent_view(intent: &ConversationIntent) -> Element<Message> {
    let mut view = Column::new().spacing(2);
    for (label, value) in [
        ("Product", &intent.product_type),
        ("Goal", &intent.achievement_goal),
        ("Audience", &intent.target_audience),
        ("Special ingredients", &intent.special_ingredients),
    ] {
        if !value.is_empty() {
            view = view.push(text(format!("• {}: {}", label, value)).size(13));
        }
    }
    view.into()
}

fn check_view<'a>(validation: &'a QueryValidation, suggestions: &'a [String]) -> Element<'a, Message> {
    let headline = if validation.is_sufficient {
        "✓ Query Ready"
    } else {
        "⚠ Query Needs Improvement"
    };

    let mut view = Column::new().spacing(4).push(
        text(format!(
            "{}  (confidence {:.0}%)",
            headline,
            validation.confidence_score * 100.0
        ))
        .size(14),
    );

    if !validation.is_sufficient {
        for info in &validation.missing_information {
            view = view.push(text(format!("Missing: {}", info)).size(13));
        }
    }
    for recommendation in &validation.recommendations {
        view = view.push(text(format!("• {}", recommendation)).size(13));
    }
    for suggestion in suggestions {
        view = view.push(text(format!("Try: {}", suggestion)).size(13));
    }

    container(view)
        .padding(8)
        .width(Length::Fill)
        .style(container::bordered_box)
        .into()
}
