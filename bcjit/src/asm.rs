//! A textual assembler for bytecode.
//!
//! Each non-blank line is a directive, a label, or an instruction; `;` starts a comment.
//! Instructions are opcode names in lower case (`load_fast`, `slice+2`) followed by an operand
//! whose form depends on the opcode:
//!
//!   * jumps and `setup_*` take a label (relative offsets are computed for the opcodes that use
//!     them);
//!   * `load_const` takes `None`, `True`, `False`, an integer, a float, or a quoted string;
//!   * local, name, and cell/free variable opcodes take a variable name;
//!   * `compare_op` takes an operator (`<`, `not in`, `exception match`, ...);
//!   * `call_function*` take a positional count and an optional keyword count;
//!   * `make_function NAME N` and `make_closure NAME N` load the code of the nested function
//!     `NAME` and then make a function with `N` defaults.
//!
//! Nested functions are written `def NAME(ARG, ...):` ... `end` and must be defined before they
//! are used. Inside a function, `.generator` marks it as a generator, and `.cells` and
//! `.freevars` list its cell and free variables. The module level is not optimized: its names
//! live in a dictionary.
//!
//! Every instruction is attributed to the source line it is written on.

use crate::{
    code::{encode, CodeDescriptor, Instr, Opcode},
    runtime::{CompareOp, ObjId, Runtime},
};
use indexmap::{IndexMap, IndexSet};
use std::{collections::HashMap, rc::Rc};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
#[error("line {line}: {msg}")]
pub struct AsmError {
    pub line: usize,
    pub msg: String,
}

/// Assemble `src` into a module-level code descriptor.
pub fn assemble(rt: &mut Runtime, src: &str) -> Result<CodeDescriptor, AsmError> {
    let lines = src
        .lines()
        .enumerate()
        .map(|(i, l)| (i + 1, strip_comment(l).trim()))
        .filter(|(_, l)| !l.is_empty())
        .collect::<Vec<_>>();
    let mut p = Parser {
        rt,
        lines,
        pos: 0,
    };
    let first = p.lines.first().map(|(n, _)| *n).unwrap_or(1);
    let code = p.code("<module>", Vec::new(), first, false)?;
    if let Some((line, l)) = p.lines.get(p.pos) {
        return Err(AsmError {
            line: *line,
            msg: format!("unexpected '{l}'"),
        });
    }
    Ok(code)
}

fn strip_comment(l: &str) -> &str {
    let mut quote = None;
    for (i, c) in l.char_indices() {
        match (quote, c) {
            (None, ';') => return &l[..i],
            (None, '\'' | '"') => quote = Some(c),
            (Some(q), _) if c == q => quote = None,
            _ => (),
        }
    }
    l
}

/// An operand which may not be resolvable until the whole function has been read.
enum Arg {
    Num(u32),
    Label(String),
}

/// The function currently being assembled.
struct CodeBuilder {
    name: String,
    instrs: Vec<(usize, Opcode, Arg)>,
    labels: HashMap<String, usize>,
    /// Constants, keyed by a normalised spelling so that each appears once.
    consts: IndexMap<String, ObjId>,
    names: IndexSet<String>,
    varnames: IndexSet<String>,
    cellvars: Vec<String>,
    freevars: Vec<String>,
    generator: bool,
    /// The constant indices of the code of nested functions.
    defs: HashMap<String, usize>,
}

impl CodeBuilder {
    fn const_index(&mut self, key: String, rt: &mut Runtime, obj: impl FnOnce(&mut Runtime) -> ObjId) -> u32 {
        if let Some(i) = self.consts.get_index_of(&key) {
            return i as u32;
        }
        let o = obj(rt);
        self.consts.insert_full(key, o).0 as u32
    }

    fn cell_index(&self, name: &str) -> Option<u32> {
        self.cellvars
            .iter()
            .chain(self.freevars.iter())
            .position(|n| n == name)
            .map(|i| i as u32)
    }
}

struct Parser<'a> {
    rt: &'a mut Runtime,
    lines: Vec<(usize, &'a str)>,
    pos: usize,
}

impl Parser<'_> {
    /// Read a function body up to its `end` (or, for the module level, the end of the input).
    fn code(
        &mut self,
        name: &str,
        args: Vec<String>,
        firstlineno: usize,
        optimized: bool,
    ) -> Result<CodeDescriptor, AsmError> {
        let mut cb = CodeBuilder {
            name: name.to_owned(),
            instrs: Vec::new(),
            labels: HashMap::new(),
            consts: IndexMap::new(),
            names: IndexSet::new(),
            varnames: args.iter().cloned().collect(),
            cellvars: Vec::new(),
            freevars: Vec::new(),
            generator: false,
            defs: HashMap::new(),
        };
        let mut end_line = firstlineno;
        while let Some(&(line, l)) = self.lines.get(self.pos) {
            end_line = line;
            if l == "end" {
                if !optimized {
                    break;
                }
                self.pos += 1;
                return self.finish(cb, args.len(), firstlineno, line, optimized);
            }
            self.pos += 1;
            let err = |msg: String| AsmError { line, msg };
            if let Some(header) = l.strip_prefix("def ") {
                let (fname, fargs) = parse_header(header).ok_or_else(|| {
                    err(format!("malformed function header '{l}'"))
                })?;
                let c = self.code(fname, fargs, line, true)?;
                let c = self.rt.new_code(Rc::new(c));
                let idx = cb.consts.insert_full(format!("<code {fname}>"), c).0;
                cb.defs.insert(fname.to_owned(), idx);
            } else if let Some(d) = l.strip_prefix('.') {
                let mut words = d.split_whitespace();
                match words.next() {
                    Some("generator") => cb.generator = true,
                    Some("cells") => cb.cellvars.extend(words.map(str::to_owned)),
                    Some("freevars") => cb.freevars.extend(words.map(str::to_owned)),
                    _ => return Err(err(format!("unknown directive '{l}'"))),
                }
            } else if let Some(label) = l.strip_suffix(':') {
                if cb.labels.insert(label.to_owned(), cb.instrs.len()).is_some() {
                    return Err(err(format!("duplicate label '{label}'")));
                }
            } else {
                self.instr(&mut cb, line, l)?;
            }
        }
        if optimized {
            return Err(AsmError {
                line: end_line,
                msg: format!("'{name}' has no 'end'"),
            });
        }
        self.finish(cb, 0, firstlineno, end_line, optimized)
    }

    fn instr(&mut self, cb: &mut CodeBuilder, line: usize, l: &str) -> Result<(), AsmError> {
        let err = |msg: String| AsmError { line, msg };
        let (mnemonic, rest) = match l.split_once(char::is_whitespace) {
            Some((m, r)) => (m, r.trim()),
            None => (l, ""),
        };
        if mnemonic == "make_function" || mnemonic == "make_closure" {
            let mut words = rest.split_whitespace();
            let (Some(fname), Some(n), None) = (words.next(), words.next(), words.next()) else {
                return Err(err(format!("expected '{mnemonic} NAME N'")));
            };
            let idx = *cb
                .defs
                .get(fname)
                .ok_or_else(|| err(format!("no function '{fname}' defined")))?;
            let n = n
                .parse::<u32>()
                .map_err(|_| err(format!("bad default count '{n}'")))?;
            cb.instrs
                .push((line, Opcode::LoadConst, Arg::Num(idx as u32)));
            let op = if mnemonic == "make_function" {
                Opcode::MakeFunction
            } else {
                Opcode::MakeClosure
            };
            cb.instrs.push((line, op, Arg::Num(n)));
            return Ok(());
        }
        let op = mnemonic
            .to_ascii_uppercase()
            .parse::<Opcode>()
            .map_err(|_| err(format!("unknown opcode '{mnemonic}'")))?;
        if !op.has_arg() {
            if !rest.is_empty() {
                return Err(err(format!("{mnemonic} takes no operand")));
            }
            cb.instrs.push((line, op, Arg::Num(0)));
            return Ok(());
        }
        if rest.is_empty() {
            return Err(err(format!("{mnemonic} needs an operand")));
        }
        let shape = Instr { op, arg: 0 };
        let arg = if shape.jump_target(0).is_some() {
            Arg::Label(rest.to_owned())
        } else {
            Arg::Num(match op {
                Opcode::LoadConst => self.constant(cb, rest).ok_or_else(|| {
                    err(format!("bad constant '{rest}'"))
                })?,
                Opcode::LoadFast | Opcode::StoreFast | Opcode::DeleteFast => {
                    cb.varnames.insert_full(rest.to_owned()).0 as u32
                }
                Opcode::LoadName
                | Opcode::StoreName
                | Opcode::DeleteName
                | Opcode::LoadGlobal
                | Opcode::StoreGlobal
                | Opcode::DeleteGlobal
                | Opcode::LoadAttr
                | Opcode::StoreAttr
                | Opcode::DeleteAttr
                | Opcode::ImportName => cb.names.insert_full(rest.to_owned()).0 as u32,
                Opcode::LoadClosure | Opcode::LoadDeref | Opcode::StoreDeref => cb
                    .cell_index(rest)
                    .ok_or_else(|| err(format!("no cell or free variable '{rest}'")))?,
                Opcode::CompareOp => (0..=CompareOp::ExcMatch as u8)
                    .filter_map(CompareOp::from_repr)
                    .find(|c| c.to_string() == rest)
                    .map(|c| c as u32)
                    .ok_or_else(|| err(format!("unknown comparison '{rest}'")))?,
                Opcode::CallFunction
                | Opcode::CallFunctionVar
                | Opcode::CallFunctionKw
                | Opcode::CallFunctionVarKw => {
                    let counts = rest
                        .split_whitespace()
                        .map(|w| w.parse::<u32>().ok().filter(|n| *n < 256))
                        .collect::<Option<Vec<_>>>()
                        .ok_or_else(|| err(format!("bad argument counts '{rest}'")))?;
                    match counts[..] {
                        [na] => na,
                        [na, nk] => na | (nk << 8),
                        _ => return Err(err(format!("bad argument counts '{rest}'"))),
                    }
                }
                _ => rest
                    .parse::<u32>()
                    .map_err(|_| err(format!("bad operand '{rest}'")))?,
            })
        };
        cb.instrs.push((line, op, arg));
        Ok(())
    }

    fn constant(&mut self, cb: &mut CodeBuilder, s: &str) -> Option<u32> {
        let rt = &mut *self.rt;
        match s {
            "None" => return Some(cb.const_index("None".to_owned(), rt, |rt| rt.new_ref(rt.none()))),
            "True" | "False" => {
                let b = s == "True";
                return Some(cb.const_index(s.to_owned(), rt, |rt| rt.new_ref(rt.bool_obj(b))));
            }
            _ => (),
        }
        if let Some(q @ ('\'' | '"')) = s.chars().next() {
            let body = s.strip_prefix(q)?.strip_suffix(q)?;
            let v = unescape(body)?;
            return Some(cb.const_index(format!("str:{v}"), rt, |rt| rt.new_str(&v)));
        }
        if let Ok(i) = s.parse::<i64>() {
            return Some(cb.const_index(format!("int:{i}"), rt, |rt| rt.new_int(i)));
        }
        let f = s.parse::<f64>().ok()?;
        Some(cb.const_index(format!("float:{s}"), rt, |rt| rt.new_float(f)))
    }

    fn finish(
        &mut self,
        cb: CodeBuilder,
        argcount: usize,
        firstlineno: usize,
        end_line: usize,
        optimized: bool,
    ) -> Result<CodeDescriptor, AsmError> {
        let mut instrs = Vec::with_capacity(cb.instrs.len());
        let mut lines: Vec<(usize, i32)> = Vec::new();
        for (idx, (line, op, arg)) in cb.instrs.iter().enumerate() {
            let arg = match arg {
                Arg::Num(n) => *n,
                Arg::Label(l) => {
                    let t = *cb.labels.get(l).ok_or_else(|| AsmError {
                        line: *line,
                        msg: format!("undefined label '{l}'"),
                    })?;
                    let shape = Instr { op: *op, arg: 0 };
                    if shape.jump_target(idx) == Some(idx + 1) {
                        // A relative jump.
                        t.checked_sub(idx + 1).ok_or_else(|| AsmError {
                            line: *line,
                            msg: format!("{op} cannot jump backwards to '{l}'"),
                        })? as u32
                    } else {
                        t as u32
                    }
                }
            };
            let line = *line as i32;
            if lines.last().map(|(_, l)| *l) != Some(line) {
                lines.push((idx, line));
            }
            instrs.push(Instr { op: *op, arg });
        }
        let err = |msg: String| AsmError {
            line: end_line,
            msg,
        };
        let mut code = CodeDescriptor::new(&cb.name, encode(&instrs)).map_err(|e| err(e.to_string()))?;
        code.argcount = argcount;
        code.flags.generator = cb.generator;
        code.flags.optimized = optimized;
        code.consts = cb.consts.into_values().collect();
        code.names = cb.names.into_iter().collect();
        code.varnames = cb.varnames.into_iter().collect();
        code.cellvars = cb.cellvars;
        code.freevars = cb.freevars;
        code.firstlineno = firstlineno as i32;
        code.lines = lines;
        code.validate().map_err(|e| err(e.to_string()))?;
        Ok(code)
    }
}

/// Parse `NAME(A, B):`.
fn parse_header(h: &str) -> Option<(&str, Vec<String>)> {
    let (name, rest) = h.split_once('(')?;
    let args = rest.strip_suffix("):")?;
    let args = args
        .split(',')
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .map(str::to_owned)
        .collect();
    Some((name.trim(), args))
}

fn unescape(s: &str) -> Option<String> {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        out.push(match chars.next()? {
            'n' => '\n',
            't' => '\t',
            c @ ('\\' | '\'' | '"') => c,
            _ => return None,
        });
    }
    Some(out)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn module_and_function() {
        let mut rt = Runtime::new();
        let code = assemble(
            &mut rt,
            "
; Comments and blank lines are ignored.
def f(a, b):
  load_fast a
  load_fast b
  compare_op <
  pop_jump_if_false no
  load_const 'yes; really'
  return_value
no:
  load_const None
  return_value
end

make_function f 0
store_name f
load_const None
return_value
",
        )
        .unwrap();
        assert!(!code.flags.optimized);
        assert_eq!(code.names, vec!["f"]);
        assert_eq!(code.firstlineno, 3);
        let f = match rt.get(code.consts[0]) {
            crate::runtime::Object::Code(c) => Rc::clone(c),
            _ => panic!(),
        };
        assert!(f.flags.optimized);
        assert_eq!(f.argcount, 2);
        assert_eq!(f.varnames, vec!["a", "b"]);
        assert_eq!(f.instrs()[3].arg, 6);
        assert_eq!(f.line_at(0), 4);
        assert_eq!(f.line_at(6), 11);
        assert_eq!(rt.str_of(f.consts[0]), "yes; really");
        // `None` is shared between the function's two returns.
        assert_eq!(f.consts.len(), 2);
        assert_eq!(
            f.disassemble(&rt).lines().nth(2),
            Some("   6     2 COMPARE_OP 0 (<)")
        );
    }

    #[test]
    fn relative_jumps_and_call_counts() {
        let mut rt = Runtime::new();
        let code = assemble(
            &mut rt,
            "
setup_loop out
load_name f
load_const 1
load_const 'k'
load_const 2
call_function 1 1
pop_top
pop_block
out:
load_const None
return_value
",
        )
        .unwrap();
        assert_eq!(code.instrs()[0], Instr { op: Opcode::SetupLoop, arg: 7 });
        assert_eq!(code.instrs()[5].call_counts(), (1, 1));
    }

    #[test]
    fn errors() {
        let mut rt = Runtime::new();
        let e = |rt: &mut Runtime, src| assemble(rt, src).unwrap_err().to_string();
        assert_eq!(e(&mut rt, "frobnicate\n"), "line 1: unknown opcode 'frobnicate'");
        assert_eq!(
            e(&mut rt, "load_const None\njump_absolute nowhere\n"),
            "line 2: undefined label 'nowhere'"
        );
        assert_eq!(e(&mut rt, "def f():\n  load_const 1\n"), "line 2: 'f' has no 'end'");
        assert_eq!(e(&mut rt, "make_function g 0\n"), "line 1: no function 'g' defined");
        assert_eq!(e(&mut rt, "return_value 3\n"), "line 1: return_value takes no operand");
        assert_eq!(
            e(&mut rt, "load_const None\nreturn_value\nend\n"),
            "line 3: unexpected 'end'"
        );
        assert!(e(&mut rt, "load_const 1\n").starts_with("line 1: General error: "));
    }
}
