use crate::{
    config::StoreMode,
    notifying_store::NotifyingStore,
    request::{Request, RequestError, SetRequest},
    response::Response,
    store::TtlStore,
};

/// The store a server process fronts, shared by every connection.
pub struct State {
    backend: Backend,
}

enum Backend {
    Ttl(TtlStore),
    Notifying(NotifyingStore),
}

impl State {
    pub fn new(mode: StoreMode) -> Self {
        let backend = match mode {
            StoreMode::Ttl => Backend::Ttl(TtlStore::new()),
            StoreMode::Notify => Backend::Notifying(NotifyingStore::new()),
        };
        State { backend }
    }

    pub fn notifying_store(&self) -> Option<&NotifyingStore> {
        match &self.backend {
            Backend::Notifying(store) => Some(store),
            Backend::Ttl(_) => None,
        }
    }

    /// Run `request` against the store. May block in notify mode while the
    /// subscriber catches up.
    pub fn handle_request<'request>(&self, request: &Request<'request>) -> Response<'request> {
        match (request, &self.backend) {
            (Request::Ping, _) => Response::Pong,
            (Request::Echo(message), _) => Response::Echo(*message),
            (Request::Set(SetRequest { ttl: None, .. }), Backend::Ttl(_)) => {
                RequestError::MissingTtl.into()
            }
            (
                Request::Set(SetRequest {
                    key,
                    value,
                    ttl: Some(ttl),
                }),
                Backend::Ttl(store),
            ) => {
                store.set(key, value, *ttl);
                Response::Ok
            }
            (Request::Set(SetRequest { ttl: Some(_), .. }), Backend::Notifying(_)) => {
                RequestError::Unsupported("set with a TTL").into()
            }
            (
                Request::Set(SetRequest {
                    key,
                    value,
                    ttl: None,
                }),
                Backend::Notifying(store),
            ) => {
                store.set(key, value);
                Response::Ok
            }
            (Request::Get(key), Backend::Ttl(store)) => Response::Value(store.get(key)),
            (Request::Get(key), Backend::Notifying(store)) => Response::Value(store.get(key)),
            (Request::Ttl(key), Backend::Ttl(store)) => Response::Ttl(store.time_to_live(key)),
            (Request::Ttl(_), Backend::Notifying(_)) => RequestError::Unsupported("ttl").into(),
            (Request::Keys, Backend::Ttl(store)) => Response::Keys(store.list_keys()),
            (Request::Keys, Backend::Notifying(_)) => RequestError::Unsupported("keys").into(),
        }
    }
}
