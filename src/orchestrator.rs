//! Per-request chat turn: validate, rebuild history, optionally add knowledge,
//! stream the engine's answer, then record the exchange exactly once.

use futures::{ stream, Stream, StreamExt };
use log::{ debug, error, info, warn };
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use crate::errors::ChatError;
use crate::history::{ reconstruct, Reconstruction, SessionStore };
use crate::llm::chat::InferenceEngine;
use crate::models::chat::{ AnswerFragment, Role, Turn };
use crate::models::request::{ ChatProcessRequest, ChatRequest };
use crate::rag::KnowledgeAugmenter;

pub const DEFAULT_SESSION_PREFIX: &str = "chatglm";

#[derive(Debug)]
pub enum ChatEvent {
    Fragment(AnswerFragment),
    Failed(ChatError),
}

pub type ChatEventStream = Pin<Box<dyn Stream<Item = ChatEvent> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Validating,
    BuildingContext,
    Streaming,
    Committing,
    Done,
    Failed,
}

impl fmt::Display for TurnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TurnState::Validating => "validating",
            TurnState::BuildingContext => "building context",
            TurnState::Streaming => "streaming",
            TurnState::Committing => "committing",
            TurnState::Done => "done",
            TurnState::Failed => "failed",
        };
        f.write_str(name)
    }
}

struct TurnContext {
    history: Reconstruction,
    prompt: String,
    footer: String,
}

enum StreamOutcome {
    Completed(String),
    Empty,
    Disconnected,
}

pub struct ChatOrchestrator {
    store: Arc<dyn SessionStore>,
    engine: Arc<dyn InferenceEngine>,
    augmenter: KnowledgeAugmenter,
    session_prefix: String,
}

impl ChatOrchestrator {
    pub fn new(
        store: Arc<dyn SessionStore>,
        engine: Arc<dyn InferenceEngine>,
        augmenter: KnowledgeAugmenter,
        session_prefix: impl Into<String>
    ) -> Self {
        Self {
            store,
            engine,
            augmenter,
            session_prefix: session_prefix.into(),
        }
    }

    pub fn new_session_id(&self) -> String {
        format!("{}{}", self.session_prefix, Uuid::new_v4().simple())
    }

    /// Starts a chat turn and returns its events in production order.
    ///
    /// An invalid request yields a single `Failed` event without touching the
    /// store. Otherwise the turn runs on its own task; dropping the returned
    /// stream cancels it before the next fragment and suppresses the commit.
    pub fn process(self: &Arc<Self>, request: ChatProcessRequest) -> ChatEventStream {
        let request = match request.validate() {
            Ok(request) => request,
            Err(e) => {
                error!("Rejected chat request while {}: {}", TurnState::Validating, e);
                return Box::pin(stream::once(async move { ChatEvent::Failed(e) }));
            }
        };

        let (tx, rx) = mpsc::channel(1);
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            orchestrator.run_turn(request, tx).await;
        });

        Box::pin(ReceiverStream::new(rx))
    }

    async fn run_turn(&self, request: ChatRequest, tx: mpsc::Sender<ChatEvent>) {
        let session_id = self.new_session_id();
        info!(
            "Chat turn {} started (parent: {}, knowledge: {}, memory window: {})",
            session_id,
            request.parent_message_id.as_deref().unwrap_or("none"),
            request.use_knowledge,
            request.params.memory_window
        );

        let context = match self.build_context(&request).await {
            Ok(context) => context,
            Err(e) => {
                Self::fail(&tx, &session_id, TurnState::BuildingContext, e).await;
                return;
            }
        };

        let answer = match self.stream_answer(&request, &context, &session_id, &tx).await {
            Ok(StreamOutcome::Completed(answer)) => answer,
            Ok(StreamOutcome::Empty) => {
                warn!("Chat turn {} produced no fragments; nothing recorded", session_id);
                return;
            }
            Ok(StreamOutcome::Disconnected) => {
                info!("Client left chat turn {} mid-stream; nothing recorded", session_id);
                return;
            }
            Err(e) => {
                Self::fail(&tx, &session_id, TurnState::Streaming, e).await;
                return;
            }
        };

        if tx.is_closed() {
            info!("Client left chat turn {} before completion; nothing recorded", session_id);
            return;
        }

        debug!("Chat turn {} is {}", session_id, TurnState::Committing);
        self.commit(&session_id, context.history.trimmed, answer).await;
        debug!("Chat turn {} is {}", session_id, TurnState::Done);
    }

    async fn build_context(&self, request: &ChatRequest) -> Result<TurnContext, ChatError> {
        let stored = match &request.parent_message_id {
            Some(parent) => {
                let stored = self.store.get(parent).await?;
                if stored.is_none() {
                    info!("Parent session '{}' not found, starting a fresh session", parent);
                }
                stored
            }
            None => None,
        };
        let history = reconstruct(stored, &request.prompt, request.params.memory_window);

        let (prompt, footer) = if request.use_knowledge {
            let augmentation = self.augmenter.augment(&request.prompt).await?;
            (augmentation.prompt, augmentation.footer)
        } else {
            (request.prompt.clone(), String::new())
        };

        Ok(TurnContext { history, prompt, footer })
    }

    async fn stream_answer(
        &self,
        request: &ChatRequest,
        context: &TurnContext,
        session_id: &str,
        tx: &mpsc::Sender<ChatEvent>
    ) -> Result<StreamOutcome, ChatError> {
        let mut fragments = self.engine.stream_chat(
            &context.prompt,
            &context.history.paired,
            &request.params
        ).await?;

        let mut last_text: Option<String> = None;
        loop {
            if tx.is_closed() {
                return Ok(StreamOutcome::Disconnected);
            }
            let text = match fragments.next().await {
                Some(fragment) => fragment?,
                None => {
                    break;
                }
            };

            let fragment = AnswerFragment {
                role: Role::Assistant,
                id: session_id.to_string(),
                parent_message_id: request.parent_message_id.clone(),
                text: format!("{}{}", text, context.footer),
            };
            if tx.send(ChatEvent::Fragment(fragment)).await.is_err() {
                return Ok(StreamOutcome::Disconnected);
            }
            last_text = Some(text);
        }

        Ok(match last_text {
            Some(answer) => StreamOutcome::Completed(answer),
            None => StreamOutcome::Empty,
        })
    }

    /// Write-back after a complete answer. A failure here only costs the next
    /// turn its memory, so it is logged and swallowed.
    async fn commit(&self, session_id: &str, mut turns: Vec<Turn>, answer: String) {
        turns.push(Turn::assistant(answer));
        let turn_count = turns.len();
        match self.store.set(session_id, turns).await {
            Ok(()) => info!("Chat turn {} recorded ({} turns)", session_id, turn_count),
            Err(e) => error!("Failed to record chat turn {}: {}", session_id, e),
        }
    }

    async fn fail(tx: &mpsc::Sender<ChatEvent>, session_id: &str, state: TurnState, e: ChatError) {
        error!("Chat turn {} {} while {}: {:?}", session_id, TurnState::Failed, state, e);
        let _ = tx.send(ChatEvent::Failed(e)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{ AtomicBool, AtomicUsize, Ordering };
    use std::sync::Mutex;
    use std::time::Duration;

    use crate::errors::{ InferenceError, RetrievalError, StoreError };
    use crate::history::MemorySessionStore;
    use crate::llm::chat::FragmentStream;
    use crate::models::request::{ ChatOptions, GenerationParams };
    use crate::rag::{ KnowledgeRecord, KnowledgeRetriever, KnowledgeTemplate, NoKnowledge };

    #[derive(Debug, Clone)]
    struct EngineCall {
        prompt: String,
        history: Vec<(String, String)>,
        params: GenerationParams,
    }

    /// Replays deltas as cumulative text; `Err` entries become stream errors.
    struct ScriptedEngine {
        script: Vec<Result<String, String>>,
        calls: Mutex<Vec<EngineCall>>,
    }

    impl ScriptedEngine {
        fn new(deltas: &[&str]) -> Self {
            Self::with_script(deltas.iter().map(|d| Ok(d.to_string())).collect())
        }

        fn with_script(script: Vec<Result<String, String>>) -> Self {
            Self { script, calls: Mutex::new(Vec::new()) }
        }

        fn calls(&self) -> Vec<EngineCall> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl InferenceEngine for ScriptedEngine {
        async fn stream_chat(
            &self,
            prompt: &str,
            history: &[(String, String)],
            params: &GenerationParams
        ) -> Result<FragmentStream, InferenceError> {
            self.calls.lock().unwrap().push(EngineCall {
                prompt: prompt.to_string(),
                history: history.to_vec(),
                params: params.clone(),
            });
            let mut answer = String::new();
            let items: Vec<Result<String, InferenceError>> = self.script
                .iter()
                .map(|step| match step {
                    Ok(delta) => {
                        answer.push_str(delta);
                        Ok(answer.clone())
                    }
                    Err(msg) => Err(InferenceError::Decode(msg.clone())),
                })
                .collect();
            Ok(Box::pin(stream::iter(items)))
        }

        fn get_model(&self) -> String {
            "scripted".to_string()
        }
    }

    /// Memory store that counts calls and can refuse writes.
    struct CountingStore {
        inner: MemorySessionStore,
        gets: AtomicUsize,
        sets: AtomicUsize,
        fail_writes: AtomicBool,
    }

    impl CountingStore {
        fn new() -> Self {
            Self {
                inner: MemorySessionStore::new(100),
                gets: AtomicUsize::new(0),
                sets: AtomicUsize::new(0),
                fail_writes: AtomicBool::new(false),
            }
        }

        fn operations(&self) -> usize {
            self.gets.load(Ordering::SeqCst) + self.sets.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SessionStore for CountingStore {
        async fn get(&self, key: &str) -> Result<Option<Vec<Turn>>, StoreError> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, turns: Vec<Turn>) -> Result<(), StoreError> {
            self.sets.fetch_add(1, Ordering::SeqCst);
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(StoreError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk full")));
            }
            self.inner.set(key, turns).await
        }

        async fn len(&self) -> Result<usize, StoreError> {
            self.inner.len().await
        }
    }

    struct FixedKnowledge(Result<Vec<KnowledgeRecord>, ()>);

    #[async_trait]
    impl KnowledgeRetriever for FixedKnowledge {
        async fn find(&self, _query: &str) -> Result<Vec<KnowledgeRecord>, RetrievalError> {
            self.0.clone().map_err(|_| RetrievalError::Config("index offline".into()))
        }
    }

    fn orchestrator_with(
        store: Arc<CountingStore>,
        engine: Arc<ScriptedEngine>,
        retriever: Arc<dyn KnowledgeRetriever>
    ) -> Arc<ChatOrchestrator> {
        Arc::new(
            ChatOrchestrator::new(
                store,
                engine,
                KnowledgeAugmenter::new(retriever, KnowledgeTemplate::default()),
                DEFAULT_SESSION_PREFIX
            )
        )
    }

    fn orchestrator(store: Arc<CountingStore>, engine: Arc<ScriptedEngine>) -> Arc<ChatOrchestrator> {
        orchestrator_with(store, engine, Arc::new(NoKnowledge))
    }

    fn request(prompt: &str, parent: Option<&str>, memory: f64) -> ChatProcessRequest {
        ChatProcessRequest {
            prompt: Some(prompt.to_string()),
            max_length: Some(2048),
            top_p: Some(7.0),
            temperature: None,
            options: parent.map(|p| ChatOptions { parent_message_id: Some(p.to_string()) }),
            memory: Some(memory),
            is_knowledge: false,
        }
    }

    fn fragments(events: &[ChatEvent]) -> Vec<&AnswerFragment> {
        events
            .iter()
            .filter_map(|e| match e {
                ChatEvent::Fragment(f) => Some(f),
                ChatEvent::Failed(_) => None,
            })
            .collect()
    }

    fn failures(events: &[ChatEvent]) -> Vec<&ChatError> {
        events
            .iter()
            .filter_map(|e| match e {
                ChatEvent::Failed(err) => Some(err),
                ChatEvent::Fragment(_) => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn blank_prompt_fails_without_touching_the_store() {
        let store = Arc::new(CountingStore::new());
        let engine = Arc::new(ScriptedEngine::new(&["never"]));
        let chat = orchestrator(store.clone(), engine.clone());

        for prompt in ["", "   ", "\n\t"] {
            let events: Vec<_> = chat.process(request(prompt, Some("chatglm1"), 50.0)).collect().await;
            assert_eq!(events.len(), 1);
            assert!(matches!(events[0], ChatEvent::Failed(ChatError::PromptEmpty)));
        }
        assert_eq!(store.operations(), 0);
        assert!(engine.calls().is_empty());
    }

    #[tokio::test]
    async fn fresh_turn_streams_cumulative_text_and_records_exchange() {
        let store = Arc::new(CountingStore::new());
        let engine = Arc::new(ScriptedEngine::new(&["Hi", " there", "!"]));
        let chat = orchestrator(store.clone(), engine.clone());

        let events: Vec<_> = chat.process(request("hello", None, 50.0)).collect().await;
        let frags = fragments(&events);
        assert!(failures(&events).is_empty());

        let texts: Vec<_> = frags.iter().map(|f| f.text.as_str()).collect();
        assert_eq!(texts, vec!["Hi", "Hi there", "Hi there!"]);

        let id = frags[0].id.clone();
        assert!(id.starts_with(DEFAULT_SESSION_PREFIX));
        assert!(frags.iter().all(|f| f.id == id && f.parent_message_id.is_none() && f.role == Role::Assistant));

        assert_eq!(store.len().await.unwrap(), 1);
        assert_eq!(
            store.get(&id).await.unwrap(),
            Some(vec![Turn::user("hello"), Turn::assistant("Hi there!")])
        );
        assert_eq!(engine.calls()[0].history, Vec::<(String, String)>::new());
        assert_eq!(engine.calls()[0].params.memory_window, 20);
    }

    #[tokio::test]
    async fn follow_up_turn_sees_previous_exchange() {
        let store = Arc::new(CountingStore::new());
        let engine = Arc::new(ScriptedEngine::new(&["answer"]));
        let chat = orchestrator(store.clone(), engine.clone());

        let first: Vec<_> = chat.process(request("q1", None, 50.0)).collect().await;
        let first_id = fragments(&first)[0].id.clone();

        let second: Vec<_> = chat.process(request("q2", Some(&first_id), 50.0)).collect().await;
        let second_frag = fragments(&second)[0].clone();
        assert_eq!(second_frag.parent_message_id.as_deref(), Some(first_id.as_str()));
        assert_ne!(second_frag.id, first_id);

        let calls = engine.calls();
        assert_eq!(calls[1].prompt, "q2");
        assert_eq!(calls[1].history, vec![("q1".to_string(), "answer".to_string())]);

        assert_eq!(
            store.get(&second_frag.id).await.unwrap(),
            Some(vec![Turn::user("q1"), Turn::assistant("answer"), Turn::user("q2"), Turn::assistant("answer")])
        );
        assert!(store.get(&first_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn unknown_parent_starts_fresh() {
        let store = Arc::new(CountingStore::new());
        let engine = Arc::new(ScriptedEngine::new(&["ok"]));
        let chat = orchestrator(store.clone(), engine.clone());

        let events: Vec<_> = chat.process(request("hi", Some("chatglm-expired"), 50.0)).collect().await;
        let frag = fragments(&events)[0].clone();
        assert_eq!(frag.parent_message_id.as_deref(), Some("chatglm-expired"));
        assert!(engine.calls()[0].history.is_empty());
        assert_eq!(store.get(&frag.id).await.unwrap(), Some(vec![Turn::user("hi"), Turn::assistant("ok")]));
    }

    #[tokio::test]
    async fn smallest_memory_preset_sends_at_most_two_pairs() {
        let store = Arc::new(CountingStore::new());
        let long: Vec<Turn> = (0..10)
            .flat_map(|i| vec![Turn::user(format!("q{}", i)), Turn::assistant(format!("a{}", i))])
            .collect();
        store.set("chatglmlong", long).await.unwrap();
        let engine = Arc::new(ScriptedEngine::new(&["x"]));
        let chat = orchestrator(store.clone(), engine.clone());

        let events: Vec<_> = chat.process(request("next", Some("chatglmlong"), 1.0)).collect().await;
        let id = fragments(&events)[0].id.clone();

        let call = &engine.calls()[0];
        assert_eq!(call.params.memory_window, 5);
        assert_eq!(call.history, vec![
            ("q8".to_string(), "a8".to_string()),
            ("q9".to_string(), "a9".to_string()),
        ]);
        assert_eq!(store.get(&id).await.unwrap().unwrap().len(), 6);
    }

    #[tokio::test]
    async fn top_p_presets_reach_the_engine() {
        for (sent, expected) in [(1.0, 0.2), (50.0, 0.5), (7.0, 0.9)] {
            let store = Arc::new(CountingStore::new());
            let engine = Arc::new(ScriptedEngine::new(&["x"]));
            let chat = orchestrator(store, engine.clone());
            let mut req = request("p", None, 50.0);
            req.top_p = Some(sent);
            let _: Vec<_> = chat.process(req).collect().await;
            assert_eq!(engine.calls()[0].params.top_p, expected);
            assert_eq!(engine.calls()[0].params.temperature, 0.9);
        }
    }

    #[tokio::test]
    async fn knowledge_footer_is_appended_to_every_fragment_but_not_stored() {
        let store = Arc::new(CountingStore::new());
        let engine = Arc::new(ScriptedEngine::new(&["A", "B"]));
        let retriever = Arc::new(
            FixedKnowledge(
                Ok(vec![KnowledgeRecord { title: "Handbook 1".into(), content: "ctx".into() }])
            )
        );
        let chat = orchestrator_with(store.clone(), engine.clone(), retriever);

        let mut req = request("question", None, 50.0);
        req.is_knowledge = true;
        let events: Vec<_> = chat.process(req).collect().await;
        let texts: Vec<_> = fragments(&events)
            .iter()
            .map(|f| f.text.clone())
            .collect();
        assert_eq!(texts, vec!["A\n参考：\nHandbook 1".to_string(), "AB\n参考：\nHandbook 1".to_string()]);

        let prompt = &engine.calls()[0].prompt;
        assert!(prompt.starts_with("system:"));
        assert!(prompt.ends_with("ctx\nuser:question"));

        let id = &fragments(&events)[0].id;
        assert_eq!(
            store.get(id).await.unwrap(),
            Some(vec![Turn::user("question"), Turn::assistant("AB")])
        );
    }

    #[tokio::test]
    async fn empty_knowledge_leaves_text_unadorned() {
        let store = Arc::new(CountingStore::new());
        let engine = Arc::new(ScriptedEngine::new(&["A", "B"]));
        let chat = orchestrator_with(store, engine, Arc::new(FixedKnowledge(Ok(vec![]))));

        let mut req = request("question", None, 50.0);
        req.is_knowledge = true;
        let events: Vec<_> = chat.process(req).collect().await;
        let texts: Vec<_> = fragments(&events)
            .iter()
            .map(|f| f.text.clone())
            .collect();
        assert_eq!(texts, vec!["A".to_string(), "AB".to_string()]);
    }

    #[tokio::test]
    async fn retrieval_failure_is_a_generic_failure() {
        let store = Arc::new(CountingStore::new());
        let engine = Arc::new(ScriptedEngine::new(&["A"]));
        let chat = orchestrator_with(store.clone(), engine.clone(), Arc::new(FixedKnowledge(Err(()))));

        let mut req = request("question", None, 50.0);
        req.is_knowledge = true;
        let events: Vec<_> = chat.process(req).collect().await;
        assert_eq!(events.len(), 1);
        assert_eq!(failures(&events)[0].code(), crate::errors::INFERENCE_FAILURE);
        assert!(engine.calls().is_empty());
        assert_eq!(store.sets.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn engine_failure_mid_stream_stops_without_commit() {
        let store = Arc::new(CountingStore::new());
        let engine = Arc::new(
            ScriptedEngine::with_script(
                vec![Ok("par".into()), Err("gpu fell over".into()), Ok("never".into())]
            )
        );
        let chat = orchestrator(store.clone(), engine);

        let events: Vec<_> = chat.process(request("hello", None, 50.0)).collect().await;
        assert_eq!(events.len(), 2);
        assert_eq!(fragments(&events)[0].text, "par");
        assert!(matches!(failures(&events)[0], ChatError::Inference(_)));
        assert_eq!(store.sets.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn write_back_failure_is_invisible_to_the_caller() {
        let store = Arc::new(CountingStore::new());
        store.fail_writes.store(true, Ordering::SeqCst);
        let engine = Arc::new(ScriptedEngine::new(&["A", "B"]));
        let chat = orchestrator(store.clone(), engine);

        let events: Vec<_> = chat.process(request("hello", None, 50.0)).collect().await;
        assert_eq!(fragments(&events).len(), 2);
        assert!(failures(&events).is_empty());
        assert_eq!(store.sets.load(Ordering::SeqCst), 1);
        assert_eq!(store.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn zero_fragment_stream_is_not_recorded() {
        let store = Arc::new(CountingStore::new());
        let engine = Arc::new(ScriptedEngine::new(&[]));
        let chat = orchestrator(store.clone(), engine);

        let events: Vec<_> = chat.process(request("hello", None, 50.0)).collect().await;
        assert!(events.is_empty());
        assert_eq!(store.sets.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn disconnect_mid_stream_skips_commit() {
        let store = Arc::new(CountingStore::new());
        let deltas: Vec<String> = (0..200).map(|i| format!("{} ", i)).collect();
        let deltas: Vec<&str> = deltas.iter().map(String::as_str).collect();
        let engine = Arc::new(ScriptedEngine::new(&deltas));
        let chat = orchestrator(store.clone(), engine);

        let mut events = chat.process(request("hello", None, 50.0));
        assert!(matches!(events.next().await, Some(ChatEvent::Fragment(_))));
        drop(events);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.sets.load(Ordering::SeqCst), 0);
        assert_eq!(store.len().await.unwrap(), 0);
    }

    #[test]
    fn session_ids_carry_the_prefix_and_differ() {
        let chat = orchestrator(Arc::new(CountingStore::new()), Arc::new(ScriptedEngine::new(&[])));
        let a = chat.new_session_id();
        let b = chat.new_session_id();
        assert!(a.starts_with("chatglm"));
        assert_eq!(a.len(), "chatglm".len() + 32);
        assert_ne!(a, b);
    }
}
