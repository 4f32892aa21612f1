//! Puffer für ICE Candidates in beide Richtungen
//!
//! Ein Candidate darf erst weiter, wenn die zugehörige Beschreibung
//! steht: ausgehend erst nach dem Offer/Answer im Datensatz, eingehend
//! erst nach der übernommenen Remote-Beschreibung.

/// Eine Richtung: hält Candidates bis `release`
#[derive(Debug, Default)]
pub struct CandidateBuffer {
    queued: Vec<String>,
    released: bool,
    /// Wie viele Einträge der Remote-Liste schon verarbeitet wurden
    seen: usize,
}

impl CandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Gibt den Candidate sofort zurück, wenn freigegeben, sonst puffern
    pub fn push(&mut self, candidate: String) -> Option<String> {
        if self.released {
            Some(candidate)
        } else {
            self.queued.push(candidate);
            None
        }
    }

    /// Nimmt die vollständige Remote-Liste eines Snapshots.
    ///
    /// Nur Einträge jenseits von `seen` sind neu; Wiederholungen eines
    /// Snapshots liefern nichts.
    pub fn observe(&mut self, all: &[String]) -> Vec<String> {
        if all.len() <= self.seen {
            return Vec::new();
        }
        let fresh: Vec<String> = all[self.seen..].to_vec();
        self.seen = all.len();
        fresh.into_iter().filter_map(|c| self.push(c)).collect()
    }

    /// Gibt frei und liefert den Puffer in Ankunftsreihenfolge
    pub fn release(&mut self) -> Vec<String> {
        self.released = true;
        std::mem::take(&mut self.queued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_buffers_until_released() {
        let mut buffer = CandidateBuffer::new();
        assert_eq!(buffer.push("a".into()), None);
        assert_eq!(buffer.push("b".into()), None);

        assert_eq!(buffer.release(), list(&["a", "b"]));
        assert_eq!(buffer.push("c".into()), Some("c".to_string()));
        assert!(buffer.release().is_empty());
    }

    #[test]
    fn test_redelivered_snapshots_never_refeed() {
        let mut buffer = CandidateBuffer::new();
        assert!(buffer.observe(&list(&["a"])).is_empty());
        assert!(buffer.observe(&list(&["a"])).is_empty());
        assert!(buffer.observe(&list(&["a", "b"])).is_empty());

        assert_eq!(buffer.release(), list(&["a", "b"]));
        assert!(buffer.observe(&list(&["a", "b"])).is_empty());
        assert_eq!(buffer.observe(&list(&["a", "b", "c", "c"])), list(&["c", "c"]));
        assert!(buffer.observe(&list(&["a"])).is_empty());
    }
}
