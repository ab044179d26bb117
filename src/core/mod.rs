//! Core Infrastructure
//!
//! HTTP transport shared by the API facade and the token refresher.

pub mod transport;

pub use transport::{
    HttpMethod, HttpRequest, HttpResponse, HttpTransport, MockHttpTransport, ReqwestHttpTransport,
};
