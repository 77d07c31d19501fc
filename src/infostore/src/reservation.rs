use infostore_lib::{
    enumerate_filename, filename_key, ContextId, DocumentId, FilenameReservation, FilenameReserver,
    FolderId, InfostoreError, InfostoreResult, ReservationOutcome, ReservationRequest,
};
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

const MAX_ENUMERATION: u32 = 10_000;

type NameKey = (ContextId, FolderId, String);

#[derive(Default)]
struct ReserverState {
    next_id: u64,
    by_key: HashMap<NameKey, (u64, DocumentId)>,
    by_id: HashMap<u64, NameKey>,
}

impl ReserverState {
    /// Owner of `name` in the folder, ignoring the requesting document itself.
    fn holder(&self, request: &ReservationRequest<'_>, name: &str) -> Option<DocumentId> {
        let key = filename_key(name);
        if let Some(owner) = request.occupied.get(&key) {
            if *owner != request.document_id {
                return Some(*owner);
            }
        }
        match self
            .by_key
            .get(&(request.context_id, request.folder_id, key))
        {
            Some((_, document_id)) if *document_id != request.document_id || *document_id < 0 => {
                Some(*document_id)
            }
            _ => None,
        }
    }

    fn first_free(&self, request: &ReservationRequest<'_>) -> Option<String> {
        (1..=MAX_ENUMERATION)
            .map(|n| enumerate_filename(request.filename, n))
            .find(|candidate| self.holder(request, candidate).is_none())
    }
}

/// Process-wide registry of in-flight filename claims.
///
/// Names are compared case-insensitively. Committed names come with each
/// request, in-flight ones are tracked here until released.
#[derive(Default)]
pub struct MemoryFilenameReserver {
    state: Mutex<ReserverState>,
}

impl MemoryFilenameReserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active_reservations(&self) -> usize {
        self.state.lock().map(|s| s.by_id.len()).unwrap_or(0)
    }
}

impl FilenameReserver for MemoryFilenameReserver {
    fn reserve(&self, request: &ReservationRequest<'_>) -> InfostoreResult<ReservationOutcome> {
        let mut state = self
            .state
            .lock()
            .map_err(|e| InfostoreError::Internal(format!("reserver lock poisoned: {}", e)))?;

        let (filename, adjusted) = match state.holder(request, request.filename) {
            None => (request.filename.to_string(), false),
            Some(conflicting_id) => {
                let suggested = state.first_free(request).ok_or_else(|| {
                    InfostoreError::InvalidState(format!(
                        "no free alternative for {} in folder {}",
                        request.filename, request.folder_id
                    ))
                })?;
                if !request.auto_adjust {
                    return Ok(ReservationOutcome::Conflict {
                        filename: request.filename.to_string(),
                        folder_id: request.folder_id,
                        conflicting_id,
                        suggested,
                    });
                }
                (suggested, true)
            }
        };

        state.next_id += 1;
        let id = state.next_id;
        let key = (request.context_id, request.folder_id, filename_key(&filename));
        state.by_key.insert(key.clone(), (id, request.document_id));
        state.by_id.insert(id, key);
        debug!(
            "filename reserved: folder={}, requested={}, reserved={}",
            request.folder_id, request.filename, filename
        );

        Ok(ReservationOutcome::Reserved(FilenameReservation {
            id,
            context_id: request.context_id,
            folder_id: request.folder_id,
            requested: request.filename.to_string(),
            filename,
            adjusted,
            adjust_title: adjusted && request.title_mirrors_filename,
        }))
    }

    fn release(&self, reservation_id: u64) {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(e) => {
                warn!("filename release: lock poisoned: {}", e);
                return;
            }
        };
        if let Some(key) = state.by_id.remove(&reservation_id) {
            if matches!(state.by_key.get(&key), Some((id, _)) if *id == reservation_id) {
                state.by_key.remove(&key);
            }
        }
    }
}

/// Holds a reservation until dropped or explicitly cleaned up.
pub struct ReservationGuard {
    reserver: Arc<dyn FilenameReserver>,
    reservation: FilenameReservation,
    released: bool,
}

impl ReservationGuard {
    pub fn new(reserver: Arc<dyn FilenameReserver>, reservation: FilenameReservation) -> Self {
        Self {
            reserver,
            reservation,
            released: false,
        }
    }

    pub fn reservation(&self) -> &FilenameReservation {
        &self.reservation
    }

    pub fn filename(&self) -> &str {
        &self.reservation.filename
    }

    pub fn clean_up(&mut self) {
        if !self.released {
            self.released = true;
            self.reserver.release(self.reservation.id);
        }
    }
}

impl Drop for ReservationGuard {
    fn drop(&mut self) {
        self.clean_up();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use infostore_lib::NEW;
    use std::collections::BTreeMap;

    fn request<'a>(
        name: &'a str,
        occupied: &'a BTreeMap<String, DocumentId>,
        auto_adjust: bool,
    ) -> ReservationRequest<'a> {
        ReservationRequest {
            context_id: 1,
            folder_id: 20,
            document_id: NEW,
            filename: name,
            auto_adjust,
            title_mirrors_filename: true,
            occupied,
        }
    }

    fn reserved(outcome: ReservationOutcome) -> FilenameReservation {
        match outcome {
            ReservationOutcome::Reserved(r) => r,
            other => panic!("expected reservation, got {:?}", other),
        }
    }

    #[test]
    fn test_concurrent_claims_get_distinct_names() {
        let reserver = Arc::new(MemoryFilenameReserver::new());
        let occupied = BTreeMap::new();

        let first = reserved(reserver.reserve(&request("report.txt", &occupied, true)).unwrap());
        let second = reserved(reserver.reserve(&request("Report.TXT", &occupied, true)).unwrap());
        assert_eq!(first.filename, "report.txt");
        assert!(!first.adjusted);
        assert_eq!(second.filename, "Report (1).TXT");
        assert!(second.adjusted);
        assert!(second.adjust_title);
    }

    #[test]
    fn test_conflict_suggests_alternative() {
        let reserver = MemoryFilenameReserver::new();
        let mut occupied = BTreeMap::new();
        occupied.insert("report.txt".to_string(), 7);
        occupied.insert("report (1).txt".to_string(), 8);

        match reserver.reserve(&request("report.txt", &occupied, false)).unwrap() {
            ReservationOutcome::Conflict {
                conflicting_id,
                suggested,
                ..
            } => {
                assert_eq!(conflicting_id, 7);
                assert_eq!(suggested, "report (2).txt");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(reserver.active_reservations(), 0);
    }

    #[test]
    fn test_own_name_is_not_a_conflict() {
        let reserver = MemoryFilenameReserver::new();
        let mut occupied = BTreeMap::new();
        occupied.insert("report.txt".to_string(), 7);
        let mut req = request("REPORT.txt", &occupied, false);
        req.document_id = 7;
        let r = reserved(reserver.reserve(&req).unwrap());
        assert_eq!(r.filename, "REPORT.txt");
    }

    #[test]
    fn test_guard_releases_once() {
        let reserver = Arc::new(MemoryFilenameReserver::new());
        let occupied = BTreeMap::new();
        let r = reserved(reserver.reserve(&request("a.txt", &occupied, true)).unwrap());
        {
            let mut guard = ReservationGuard::new(reserver.clone(), r);
            assert_eq!(reserver.active_reservations(), 1);
            guard.clean_up();
            guard.clean_up();
            assert_eq!(reserver.active_reservations(), 0);
        }
        let again = reserved(reserver.reserve(&request("a.txt", &occupied, false)).unwrap());
        assert!(!again.adjusted);
    }
}
