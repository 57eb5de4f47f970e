use std::sync::Arc;

use crate::claim::ClaimIdFactory;
use crate::client::ClaimClient;
use crate::config::StartdConfig;
use crate::event::EventSender;
use crate::policy::PolicyEvaluator;
use crate::starter::Starter;
use crate::timer::TimerService;

/// Everything a slot or claim needs from its surroundings.
///
/// Built once by the daemon and passed by reference into every operation.
#[derive(Clone)]
pub struct Context {
    pub config: Arc<StartdConfig>,
    pub timers: TimerService,
    pub policy: Arc<dyn PolicyEvaluator>,
    pub starter: Arc<dyn Starter>,
    pub client: Arc<dyn ClaimClient>,
    pub ids: Arc<ClaimIdFactory>,
    pub events: EventSender,
}

impl Context {
    pub fn new(
        config: StartdConfig,
        policy: Arc<dyn PolicyEvaluator>,
        starter: Arc<dyn Starter>,
        client: Arc<dyn ClaimClient>,
        events: EventSender,
    ) -> Self {
        let birthday = chrono::Utc::now().timestamp();
        let ids = Arc::new(ClaimIdFactory::new(config.node.address.clone(), birthday));
        Self {
            config: Arc::new(config),
            timers: TimerService::new(events.clone()),
            policy,
            starter,
            client,
            ids,
            events,
        }
    }
}
