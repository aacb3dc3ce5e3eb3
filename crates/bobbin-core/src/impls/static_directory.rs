//! StaticResourceDirectory - 固定の参加者リスト

use std::collections::BTreeMap;

use crate::domain::errors::EngineError;
use crate::domain::participant::{Participant, ResourcingSpec};
use crate::ports::ResourceDirectory;

/// StaticResourceDirectory は起動時に渡された参加者だけを知っている
///
/// 検索結果は参加者 ID 順。
#[derive(Debug, Clone, Default)]
pub struct StaticResourceDirectory {
    participants: BTreeMap<String, Participant>,
}

impl StaticResourceDirectory {
    pub fn new(participants: impl IntoIterator<Item = Participant>) -> Self {
        Self {
            participants: participants
                .into_iter()
                .map(|p| (p.id.clone(), p))
                .collect(),
        }
    }

    pub fn insert(&mut self, participant: Participant) {
        self.participants.insert(participant.id.clone(), participant);
    }
}

impl ResourceDirectory for StaticResourceDirectory {
    fn find_participants(&self, query: &ResourcingSpec) -> Result<Vec<Participant>, EngineError> {
        Ok(self
            .participants
            .values()
            .filter(|p| query.matches(p))
            .cloned()
            .collect())
    }

    fn participant(&self, id: &str) -> Option<Participant> {
        self.participants.get(id).cloned()
    }
}
