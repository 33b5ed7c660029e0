use cil_vm::{
    resolve::Assemblies,
    types::{MethodBody, MethodSignature},
    utils::il_label,
    value::ValueKind,
    vm::{analyze, bytecode::BytecodeBuffer, opcodes::OperandKind},
};
use clap::Parser;
use std::{path::PathBuf, process::ExitCode};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Disassemble a raw IL method body and print its stack-type annotations"
)]
struct Args {
    /// File holding the IL bytes of the body
    il: PathBuf,
    /// Parameter kinds, e.g. `--arg i4 --arg r8`
    #[arg(long = "arg", value_name = "KIND")]
    args: Vec<String>,
    #[arg(long, value_name = "KINDS", value_delimiter = ',')]
    locals: Vec<String>,
    #[arg(long, value_name = "KIND")]
    returns: Option<String>,
    #[arg(long, default_value_t = 8)]
    max_stack: u16,
}

fn kinds(names: &[String]) -> Result<Vec<ValueKind>, String> {
    names
        .iter()
        .map(|n| ValueKind::from_name(n.trim()).ok_or_else(|| format!("unknown kind {:?}", n)))
        .collect()
}

fn operand(code: &BytecodeBuffer, pc: usize) -> Result<String, String> {
    let op = code.opcode_at(pc).map_err(|e| e.to_string())?;
    let text = match op.operand() {
        OperandKind::None => String::new(),
        OperandKind::ShortBrTarget | OperandKind::BrTarget => {
            format!("{:?}", il_label(code.branch_target(pc).map_err(|e| e.to_string())?))
        }
        OperandKind::Switch => {
            let targets = code.switch_targets(pc).map_err(|e| e.to_string())?;
            let labels: Vec<_> = targets.into_iter().map(|t| format!("{:?}", il_label(t))).collect();
            format!("({})", labels.join(", "))
        }
        OperandKind::ShortI => code.imm_i8(pc).map_err(|e| e.to_string())?.to_string(),
        OperandKind::I => code.imm_i32(pc).map_err(|e| e.to_string())?.to_string(),
        OperandKind::I8 => code.imm_i64(pc).map_err(|e| e.to_string())?.to_string(),
        OperandKind::ShortR => code.imm_f32(pc).map_err(|e| e.to_string())?.to_string(),
        OperandKind::R => code.imm_f64(pc).map_err(|e| e.to_string())?.to_string(),
        OperandKind::ShortVar | OperandKind::Var => code.imm_var(pc).map_err(|e| e.to_string())?.to_string(),
        _ => code.imm_token(pc).map_err(|e| e.to_string())?.to_string(),
    };
    Ok(text)
}

fn dump(args: Args) -> Result<(), String> {
    let il = std::fs::read(&args.il).map_err(|e| format!("cannot read {}: {}", args.il.display(), e))?;
    let returns = args
        .returns
        .as_deref()
        .map(|r| ValueKind::from_name(r).ok_or_else(|| format!("unknown kind {:?}", r)))
        .transpose()?;

    let assemblies = Assemblies::new();
    let body = MethodBody::new(il.clone(), args.max_stack).with_locals(kinds(&args.locals)?);
    let token = assemblies
        .define_method("dump", MethodSignature::new_static(kinds(&args.args)?, returns), body)
        .map_err(|e| e.to_string())?;
    let method = assemblies.method(token).map_err(|e| e.to_string())?;

    let code = BytecodeBuffer::new(&il);
    let analysis = analyze(&method, &assemblies).map_err(|e| e.to_string())?;
    let mut pc = 0;
    while pc < code.len() {
        let op = code.opcode_at(pc).map_err(|e| e.to_string())?;
        let ty = analysis.op_type(pc).map(|t| t.to_string()).unwrap_or_default();
        let depth = analysis
            .stack_depth(pc)
            .map_or_else(|| "-".to_string(), |d| d.to_string());
        println!(
            "{:?}: {:<12} {:<16} depth {:<3} {}",
            il_label(pc),
            op.mnemonic(),
            operand(&code, pc)?,
            depth,
            ty
        );
        pc = code.next_pc(pc).map_err(|e| e.to_string())?;
    }
    Ok(())
}

fn main() -> ExitCode {
    cil_vm::init_logging();
    match dump(Args::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::from(2)
        }
    }
}
