use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::Context;
use crate::policy::Attributes;
use crate::slot::{Slot, SlotType, State};

/// One published slot record.
///
/// `public` goes to anyone who asks the collector. `private` carries the
/// claim token and is only handed out over the collector's secured channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotRecord {
    pub name: String,
    pub public: Attributes,
    pub private: Attributes,
}

impl SlotRecord {
    pub fn state(&self) -> Option<State> {
        self.public
            .get("State")
            .and_then(Value::as_str)
            .and_then(State::parse)
    }

    pub fn claim_id(&self) -> Option<&str> {
        self.private.get("ClaimId").and_then(Value::as_str)
    }

    pub fn number(&self, name: &str) -> Option<f64> {
        self.public.get(name).and_then(Value::as_f64)
    }
}

impl Slot {
    /// Rebuild the slot's attribute record from its current state.
    pub(crate) fn refresh_ad(&mut self, ctx: &Context) {
        let retirement = (self.state() == State::Claimed).then(|| self.retirement_remaining(ctx));

        let mut ad = Attributes::new();
        ad.insert("Name".into(), Value::from(self.name.clone()));
        ad.insert("SlotId".into(), Value::from(self.id.0));
        ad.insert("SlotType".into(), Value::from(self.kind.to_string()));
        ad.insert(
            "PartitionableSlot".into(),
            Value::from(self.kind == SlotType::Partitionable),
        );
        if let Some(parent) = self.parent {
            ad.insert("ParentSlotId".into(), Value::from(parent.0));
        }
        ad.insert("Machine".into(), Value::from(ctx.config.node.host.clone()));
        ad.insert("MyAddress".into(), Value::from(ctx.config.node.address.clone()));
        ad.insert("Cpus".into(), Value::from(self.cpus));
        ad.insert("Memory".into(), Value::from(self.memory_mb));

        ad.insert("State".into(), Value::from(self.state().as_str()));
        ad.insert("Activity".into(), Value::from(self.activity().as_str()));
        ad.insert(
            "EnteredCurrentState".into(),
            Value::from(self.machine.entered_state_wall()),
        );
        ad.insert(
            "EnteredCurrentActivity".into(),
            Value::from(self.machine.entered_activity_wall()),
        );
        if let Some(dest) = self.machine.destination() {
            ad.insert("Destination".into(), Value::from(dest.as_str()));
        }

        self.reqexp.publish(&*ctx.policy, &mut ad);

        if matches!(self.state(), State::Claimed | State::Preempting) {
            ad.insert("PublicClaimId".into(), Value::from(self.current.id().public_id()));
            self.current.publish(&mut ad);
        } else {
            ad.insert("CurrentRank".into(), Value::from(0.0));
        }
        if let Some(reason) = self.current.vacate_reason() {
            ad.insert("VacateReason".into(), Value::from(reason));
        }
        if let Some(remaining) = retirement {
            ad.insert("RetirementTimeRemaining".into(), Value::from(remaining));
        }
        if let Some(pre) = self.preempting.as_ref().filter(|p| p.has_request()) {
            pre.publish_preempting(&mut ad);
        }

        ad.insert("Draining".into(), Value::from(self.draining.is_some()));
        if let Some(drain) = &self.draining {
            ad.insert("DrainingRequestId".into(), Value::from(drain.request_id.to_string()));
            ad.insert("DrainReason".into(), Value::from(drain.reason.clone()));
        }
        ad.insert(
            "AcceptedWhileDraining".into(),
            Value::from(self.accepted_while_draining),
        );

        self.cod.publish(&mut ad);

        for (name, secs) in self.machine.history_counters() {
            ad.insert(name, Value::from(secs));
        }
        self.ad = ad;
    }

    /// Public and private records as they stand.
    pub fn record(&self) -> SlotRecord {
        let mut private = Attributes::new();
        private.insert("Name".into(), Value::from(self.name.clone()));
        let claim = self.preempting.as_ref().unwrap_or(&self.current);
        private.insert("ClaimId".into(), Value::from(claim.id().secret()));
        SlotRecord {
            name: self.name.clone(),
            public: self.ad.clone(),
            private,
        }
    }
}
