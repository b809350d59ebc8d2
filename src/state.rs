use crate::counter::CounterStore;

#[derive(Clone)]
pub struct AppState {
    pub counters: CounterStore,
}

impl AppState {
    pub fn new(counters: CounterStore) -> Self {
        Self { counters }
    }
}
