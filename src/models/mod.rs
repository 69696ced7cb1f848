pub mod session_api;

pub use session_api::{
    BatchItem, BatchResponse, ClassifiedRequest, CloseSessionRequest, CloseSessionResponse,
    ContinueResponse, OpenSessionResponse, RequestBody, RequestKind, SessionRequest,
    StartSessionRequest, TextPromptRequest, TextPromptResponse,
};
