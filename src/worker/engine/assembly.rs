use super::{Args, CallError, CallResult, Output, Sequence, WorkerObject};
use crate::model::{AssemblySettings, FragmentInfo};
use std::sync::Arc;

/// Ordered list of fragments to join.
#[derive(Debug, Clone, Default)]
pub struct Assembly {
    fragments: Vec<Arc<Sequence>>,
}

impl Assembly {
    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    pub fn push(&mut self, fragment: Arc<Sequence>) {
        self.fragments.push(fragment);
    }

    /// Join the fragments end to end.
    pub fn assemble(&self, settings: AssemblySettings) -> CallResult<AssemblyResult> {
        if self.is_empty() {
            return Err(CallError::new("Assembly has no fragments"));
        }
        Ok(AssemblyResult {
            fragments: self.fragments.clone(),
            circular: settings.circular,
        })
    }

    pub(super) fn call(&mut self, method: &str, args: &mut Args) -> CallResult<Output> {
        match method {
            "push" => {
                let fragment = args.seq(0)?;
                self.push(fragment);
                Output::unit()
            }
            "len" => Output::value(self.len()),
            "clone" => Ok(Output::Object(WorkerObject::Assembly(self.clone()))),
            "assemble" => {
                let settings: AssemblySettings = args.opt_value(0)?.unwrap_or_default();
                let result = self.assemble(settings)?;
                Ok(Output::Object(WorkerObject::AssemblyResult(Arc::new(result))))
            }
            _ => Err(CallError::no_method("Assembly", method)),
        }
    }
}

#[derive(Debug)]
pub struct AssemblyResult {
    fragments: Vec<Arc<Sequence>>,
    circular: bool,
}

impl AssemblyResult {
    pub fn fragment_count(&self) -> usize {
        self.fragments.len()
    }

    pub fn fragments(&self) -> Vec<FragmentInfo> {
        let mut offset = 0;
        self.fragments
            .iter()
            .enumerate()
            .map(|(idx, frag)| {
                let start = offset;
                offset += frag.len();
                FragmentInfo {
                    name: frag
                        .name
                        .clone()
                        .unwrap_or_else(|| format!("fragment {}", idx + 1)),
                    start,
                    end: offset,
                }
            })
            .collect()
    }

    pub fn product(&self, name: Option<String>) -> Sequence {
        let seq = self
            .fragments
            .iter()
            .flat_map(|frag| frag.seq.iter().copied())
            .collect();
        Sequence {
            name: Some(name.unwrap_or_else(|| "Assembly product".to_string())),
            seq,
            circular: self.circular,
        }
    }
}

pub(super) fn call_result(
    result: &Arc<AssemblyResult>,
    method: &str,
    args: &mut Args,
) -> CallResult<Output> {
    match method {
        "get_fragments" => Output::value(result.fragments()),
        "extract_product" => {
            let name: Option<String> = args.opt_value(0)?;
            Ok(Output::Object(WorkerObject::Seq(Arc::new(
                result.product(name),
            ))))
        }
        _ => Err(CallError::no_method("AssemblyResult", method)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::engine::ResolvedArg;
    use serde_json::json;

    fn seq_arg(name: &str, bases: &[u8]) -> ResolvedArg {
        ResolvedArg::Object(WorkerObject::Seq(Arc::new(Sequence::new(
            name,
            bases.to_vec(),
        ))))
    }

    #[test]
    fn test_push_and_assemble() {
        let mut asm = Assembly::default();
        asm.call("push", &mut Args::new(vec![seq_arg("a", b"AAAA")]))
            .unwrap();
        asm.call("push", &mut Args::new(vec![seq_arg("b", b"CC")]))
            .unwrap();
        assert_eq!(asm.len(), 2);

        let result = asm
            .assemble(AssemblySettings { circular: true })
            .unwrap();
        let frags = result.fragments();
        assert_eq!(frags[1], FragmentInfo { name: "b".to_string(), start: 4, end: 6 });

        let product = result.product(None);
        assert_eq!(product.seq, b"AAAACC");
        assert!(product.circular);
    }

    #[test]
    fn test_push_requires_seq() {
        let mut asm = Assembly::default();
        let err = asm
            .call("push", &mut Args::new(vec![ResolvedArg::Value(json!(1))]))
            .unwrap_err();
        assert!(err.to_string().contains("not an object"));
    }

    #[test]
    fn test_empty_assembly_fails() {
        let err = Assembly::default()
            .assemble(AssemblySettings::default())
            .unwrap_err();
        assert!(err.to_string().contains("no fragments"));
    }

    #[test]
    fn test_clone_is_independent() {
        let mut asm = Assembly::default();
        asm.push(Arc::new(Sequence::new("a", b"A".to_vec())));
        let copy = match asm.call("clone", &mut Args::default()).unwrap() {
            Output::Object(WorkerObject::Assembly(copy)) => copy,
            other => panic!("Expected assembly, got {:?}", other),
        };
        asm.push(Arc::new(Sequence::new("b", b"C".to_vec())));
        assert_eq!(copy.len(), 1);
        assert_eq!(asm.len(), 2);
    }
}
