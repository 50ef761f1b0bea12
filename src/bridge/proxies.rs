//! Typed proxies for the worker-side classes.
//!
//! Every proxy wraps one [`Handle`]. Methods forward to the worker and
//! return a [`Reply`] future. `free` consumes the proxy, so a freed proxy
//! cannot be used again.

use super::Connection;
use super::handle::{
    Handle, Proxy, Reply, decode_binary, decode_object, decode_objects, decode_unit,
    decode_value,
};
use crate::model::{
    AssemblySettings, FragmentInfo, Metadata, PcrMatch, PcrProduct, PcrSettings, PcrStatus,
    Primer, SearchHit,
};
use crate::protocol::{Arg, ArgKind, ObjectId, ObjectType};
use crate::suspense::{CacheIdentity, CacheTarget};
use serde_json::json;

macro_rules! remote_class {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug)]
        pub struct $name {
            handle: Handle,
        }

        impl Proxy for $name {
            const TYPE: ObjectType = ObjectType::$name;

            fn from_handle(handle: Handle) -> Self {
                Self { handle }
            }

            fn handle(&self) -> &Handle {
                &self.handle
            }
        }

        impl $name {
            /// Worker-side id of the object.
            pub fn id(&self) -> Option<ObjectId> {
                self.handle.id()
            }

            /// Release the worker-side object.
            pub fn free(mut self) {
                self.handle.release();
            }
        }

        impl CacheTarget for $name {
            fn cache_identity(&self) -> CacheIdentity {
                self.handle.cache_identity()
            }
        }
    };
}

remote_class!(
    /// A DNA sequence.
    Seq
);
remote_class!(
    /// An ordered set of fragments to join.
    Assembly
);
remote_class!(AssemblyResult);
remote_class!(
    /// A running or finished PCR simulation.
    Pcrer
);
remote_class!(PcrResults);

/// Any worker object, tagged by class.
#[derive(Debug)]
pub enum RemoteObject {
    Seq(Seq),
    Assembly(Assembly),
    AssemblyResult(AssemblyResult),
    Pcrer(Pcrer),
    PcrResults(PcrResults),
}

impl RemoteObject {
    /// Wrap `handle` in the proxy for its type tag.
    pub(crate) fn wrap(handle: Handle) -> Self {
        match handle.object_type() {
            ObjectType::Seq => Self::Seq(Seq::from_handle(handle)),
            ObjectType::Assembly => Self::Assembly(Assembly::from_handle(handle)),
            ObjectType::AssemblyResult => Self::AssemblyResult(AssemblyResult::from_handle(handle)),
            ObjectType::Pcrer => Self::Pcrer(Pcrer::from_handle(handle)),
            ObjectType::PcrResults => Self::PcrResults(PcrResults::from_handle(handle)),
        }
    }

    pub fn handle(&self) -> &Handle {
        match self {
            Self::Seq(p) => &p.handle,
            Self::Assembly(p) => &p.handle,
            Self::AssemblyResult(p) => &p.handle,
            Self::Pcrer(p) => &p.handle,
            Self::PcrResults(p) => &p.handle,
        }
    }

    pub fn object_type(&self) -> ObjectType {
        self.handle().object_type()
    }

    fn into_handle(self) -> Handle {
        match self {
            Self::Seq(p) => p.handle,
            Self::Assembly(p) => p.handle,
            Self::AssemblyResult(p) => p.handle,
            Self::Pcrer(p) => p.handle,
            Self::PcrResults(p) => p.handle,
        }
    }

    /// The typed proxy, or `self` back if the class differs.
    pub fn downcast<P: Proxy>(self) -> Result<P, Self> {
        if self.object_type() == P::TYPE {
            Ok(P::from_handle(self.into_handle()))
        } else {
            Err(self)
        }
    }

    pub fn free(self) {
        self.into_handle().release();
    }
}

/// Echo `n` through the worker.
pub fn tester(conn: &Connection, n: u32) -> Reply<u32> {
    conn.invoke(None, "tester", vec![Arg::Value(json!(n))], ArgKind::Value, decode_value)
}

/// Parse every record of a FASTA file. The bytes are moved to the worker.
pub fn parse_fasta(conn: &Connection, data: Vec<u8>) -> Reply<Vec<Seq>> {
    conn.invoke(
        None,
        "parse_fasta",
        vec![Arg::Binary(data)],
        ArgKind::ObjectArray,
        decode_objects,
    )
}

/// Decode a sequence written by [`Seq::to_bin`].
pub fn parse_bin(conn: &Connection, data: Vec<u8>) -> Reply<Seq> {
    conn.invoke(
        None,
        "parse_bin",
        vec![Arg::Binary(data)],
        ArgKind::Object,
        decode_object,
    )
}

impl Seq {
    fn derive(&self, method: &str, args: Vec<Arg>) -> Reply<Seq> {
        self.handle.call(method, args, ArgKind::Object, decode_object)
    }

    pub fn get_metadata(&self) -> Reply<Metadata> {
        self.handle
            .call("get_metadata", vec![], ArgKind::Value, decode_value)
    }

    pub fn is_empty(&self) -> Reply<bool> {
        self.handle
            .call("is_empty", vec![], ArgKind::Value, decode_value)
    }

    pub fn set_name(&self, name: &str) -> Reply<Seq> {
        self.derive("set_name", vec![Arg::Value(json!(name))])
    }

    pub fn set_circular(&self, circular: bool) -> Reply<Seq> {
        self.derive("set_circular", vec![Arg::Value(json!(circular))])
    }

    pub fn revcomp(&self) -> Reply<Seq> {
        self.derive("revcomp", vec![])
    }

    /// Bases in `start..end` as text; empty for an invalid range.
    pub fn get_seq_slice(&self, start: usize, end: usize) -> Reply<String> {
        self.handle.call(
            "get_seq_slice",
            vec![Arg::Value(json!(start)), Arg::Value(json!(end))],
            ArgKind::Value,
            decode_value,
        )
    }

    pub fn extract_range(&self, start: usize, end: usize, name: Option<&str>) -> Reply<Seq> {
        self.derive(
            "extract_range",
            vec![
                Arg::Value(json!(start)),
                Arg::Value(json!(end)),
                Arg::Value(json!(name)),
            ],
        )
    }

    pub fn set_origin(&self, origin: usize) -> Reply<Seq> {
        self.derive("set_origin", vec![Arg::Value(json!(origin))])
    }

    /// Search both strands; up to `max_res + 1` hits.
    pub fn search_seq(&self, query: &str, max_res: usize) -> Reply<Vec<SearchHit>> {
        self.handle.call(
            "search_seq",
            vec![Arg::Value(json!(query)), Arg::Value(json!(max_res))],
            ArgKind::Value,
            decode_value,
        )
    }

    /// Serialize into the versioned binary format.
    pub fn to_bin(&self) -> Reply<Vec<u8>> {
        self.handle
            .call("to_bin", vec![], ArgKind::Binary, decode_binary)
    }

    /// A new worker object with the same content.
    pub fn clone_remote(&self) -> Reply<Seq> {
        self.derive("clone", vec![])
    }
}

impl Assembly {
    pub fn create(conn: &Connection) -> Reply<Assembly> {
        conn.construct_with(|| Ok(vec![]))
    }

    /// Append a fragment. The sequence stays owned by the caller.
    pub fn push(&self, fragment: &Seq) -> Reply<()> {
        self.handle
            .call_with("push", || Ok(vec![fragment.handle.arg()?]), ArgKind::Value, decode_unit)
    }

    pub fn len(&self) -> Reply<usize> {
        self.handle.call("len", vec![], ArgKind::Value, decode_value)
    }

    pub fn clone_remote(&self) -> Reply<Assembly> {
        self.handle
            .call("clone", vec![], ArgKind::Object, decode_object)
    }

    pub fn assemble(&self, settings: AssemblySettings) -> Reply<AssemblyResult> {
        self.handle.call_with(
            "assemble",
            || Ok(vec![Arg::value(settings)?]),
            ArgKind::Object,
            decode_object,
        )
    }
}

impl AssemblyResult {
    pub fn get_fragments(&self) -> Reply<Vec<FragmentInfo>> {
        self.handle
            .call("get_fragments", vec![], ArgKind::Value, decode_value)
    }

    pub fn extract_product(&self, name: Option<&str>) -> Reply<Seq> {
        self.handle.call(
            "extract_product",
            vec![Arg::Value(json!(name))],
            ArgKind::Object,
            decode_object,
        )
    }
}

impl Pcrer {
    /// Start a PCR simulation of `primers` on `template`.
    pub fn create(
        conn: &Connection,
        template: &Seq,
        primers: &[Primer],
        settings: PcrSettings,
    ) -> Reply<Pcrer> {
        conn.construct_with(|| {
            Ok(vec![
                template.handle.arg()?,
                Arg::value(primers)?,
                Arg::value(settings)?,
            ])
        })
    }

    pub fn get_status(&self) -> Reply<PcrStatus> {
        self.handle
            .call("get_status", vec![], ArgKind::Value, decode_value)
    }

    pub fn get_settings(&self) -> Reply<PcrSettings> {
        self.handle
            .call("get_settings", vec![], ArgKind::Value, decode_value)
    }

    pub fn cancel(&self) -> Reply<()> {
        self.handle.call("cancel", vec![], ArgKind::Value, decode_unit)
    }

    /// Fails until the simulation is done, and forever once cancelled.
    pub fn get_result(&self) -> Reply<PcrResults> {
        self.handle
            .call("get_result", vec![], ArgKind::Object, decode_object)
    }
}

impl PcrResults {
    pub fn get_matches(&self) -> Reply<Vec<PcrMatch>> {
        self.handle
            .call("get_matches", vec![], ArgKind::Value, decode_value)
    }

    pub fn get_products(&self) -> Reply<Vec<PcrProduct>> {
        self.handle
            .call("get_products", vec![], ArgKind::Value, decode_value)
    }

    pub fn extract_product(&self, idx: usize) -> Reply<Seq> {
        self.handle.call(
            "extract_product",
            vec![Arg::Value(json!(idx))],
            ArgKind::Object,
            decode_object,
        )
    }
}
