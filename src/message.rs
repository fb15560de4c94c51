// Non-blocking network I/O framework with filter-chain pipelines
//
// SPDX-License-Identifier: Apache-2.0
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::any::Any;
use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use bytes::Bytes;

/// Type-erased message travelling through a [`crate::FilterChain`].
///
/// Messages read by a processor are always [`Bytes`]; filters may replace
/// them with any other type on their way to the [`crate::IoHandler`] and must
/// turn them back into [`Bytes`] on the way to the transport.
#[derive(Clone)]
pub struct Message(Arc<dyn Any + Send + Sync>);

impl Message {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self { Message(Arc::new(value)) }

    pub fn is<T: Any>(&self) -> bool { self.0.is::<T>() }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> { self.0.downcast_ref::<T>() }

    /// Returns the byte payload if the message is an (encoded) byte buffer.
    pub fn as_bytes(&self) -> Option<&Bytes> { self.downcast_ref::<Bytes>() }

    /// Number of payload bytes, if the message is a byte buffer.
    pub fn len(&self) -> Option<usize> { self.as_bytes().map(Bytes::len) }
}

impl Debug for Message {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.as_bytes() {
            Some(bytes) => write!(f, "Message({} bytes)", bytes.len()),
            None => f.write_str("Message(..)"),
        }
    }
}

impl From<Bytes> for Message {
    fn from(bytes: Bytes) -> Self { Message::new(bytes) }
}

impl From<Vec<u8>> for Message {
    fn from(vec: Vec<u8>) -> Self { Message::new(Bytes::from(vec)) }
}

impl From<&'static [u8]> for Message {
    fn from(slice: &'static [u8]) -> Self { Message::new(Bytes::from_static(slice)) }
}

impl From<&'static str> for Message {
    fn from(s: &'static str) -> Self { Message::new(Bytes::from_static(s.as_bytes())) }
}

impl From<String> for Message {
    fn from(s: String) -> Self { Message::new(Bytes::from(s)) }
}
