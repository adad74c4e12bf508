//! Text renderers for the files handed to the build tool and the simulator.

use std::path::Path;

use crate::core::{MemoryRegion, Sample};

/// Devicetree overlay replacing the `reg` property of `region`.
pub fn flash_overlay(region: &MemoryRegion) -> String {
    format!(
        "&{} {{\n\treg = <{:#x} {:#x}>;\n}};\n",
        region.name, region.base_address, region.size_bytes
    )
}

/// Command run on the first CPU after the platform is loaded, chosen from the
/// generated machine description.
pub fn post_boot_command(topology: &str, board: &str, sample: Sample) -> Option<String> {
    if topology.contains("cortex-m") {
        Some("cpu0 VectorTableOffset `sysbus GetSymbolAddress \"_vector_table\"`".to_string())
    } else if topology.contains("RiscV") {
        Some(format!(
            "cpu0 EnableProfiler true $ORIGIN/{}-{}-profile true",
            board,
            sample.name()
        ))
    } else {
        None
    }
}

pub struct ControlScript<'a> {
    pub board: &'a str,
    pub sample: Sample,
    pub platform: &'a Path,
    pub elf: &'a Path,
    pub console: &'a str,
    pub post_boot: Option<&'a str>,
}

impl ControlScript<'_> {
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(":name: {}-{}\n", self.board, self.sample.name()));
        out.push_str(":description: Auto-generated from the board devicetree.\n\n");
        out.push_str("using sysbus\n");
        out.push_str(&format!("$name?=\"{}\"\n", self.board));
        out.push_str("mach create $name\n\n");
        out.push_str(&format!(
            "machine LoadPlatformDescription @{}\n",
            self.platform.display()
        ));
        out.push_str(&format!("$bin?=@{}\n\n", self.elf.display()));
        out.push_str(&format!("showAnalyzer {}\n", self.console));
        out.push_str(&format!(
            "{} RecordToAsciinema $ORIGIN/{}-{}-asciinema\n\n",
            self.console,
            self.board,
            self.sample.name()
        ));
        out.push_str("macro reset\n\"\"\"\n    sysbus LoadELF $bin\n");
        if let Some(cmd) = self.post_boot {
            out.push_str(&format!("    {}\n", cmd));
        }
        out.push_str("\"\"\"\n\nrunMacro $reset\n");
        out
    }
}

/// Robot Framework test case for one sample.
pub struct TestScript<'a> {
    pub board: &'a str,
    pub config_board: &'a str,
    pub console: &'a str,
    pub sample: Sample,
    pub control_script: &'a Path,
}

impl TestScript<'_> {
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str("*** Variables ***\n");
        out.push_str(&format!("${{UART}}    sysbus.{}\n", self.console));
        out.push_str(&format!("${{RESC}}    @{}\n\n", self.control_script.display()));
        out.push_str("*** Keywords ***\n");
        out.push_str("Prepare Machine\n");
        out.push_str("    Execute Command    include ${RESC}\n");
        out.push_str("    Create Terminal Tester    ${UART}    defaultPauseEmulation=True\n\n");
        out.push_str("*** Test Cases ***\n");
        out.push_str(&format!("Run {} on {}\n", self.sample.name(), self.board));
        out.push_str("    Prepare Machine\n");
        out.push_str("    Start Emulation\n");
        for line in self.steps() {
            out.push_str("    ");
            out.push_str(&line);
            out.push('\n');
        }
        out
    }

    fn steps(&self) -> Vec<String> {
        match self.sample {
            Sample::HelloWorld => vec![format!(
                "Wait For Line On Uart    Hello World! {}",
                self.config_board
            )],
            Sample::ShellModule => vec![
                "Wait For Prompt On Uart    uart:~$".to_string(),
                "Write Line To Uart    demo board".to_string(),
                format!("Wait For Line On Uart    {}", self.config_board),
            ],
            Sample::Philosophers => vec![
                "Wait For Line On Uart    Philosopher 0.*THINKING    treatAsRegex=true".to_string(),
                "Wait For Line On Uart    Philosopher 0.*HOLDING    treatAsRegex=true".to_string(),
                "Wait For Line On Uart    Philosopher 0.*EATING    treatAsRegex=true".to_string(),
            ],
            Sample::Micropython => vec![
                "Wait For Prompt On Uart    >>>".to_string(),
                "Write Line To Uart    2+2".to_string(),
                "Wait For Line On Uart    4".to_string(),
                "Write Line To Uart    def compute(a, b): return a * b".to_string(),
                "Write Line To Uart    compute(6, 7)".to_string(),
                "Wait For Line On Uart    42".to_string(),
            ],
            Sample::TensorflowLiteMicro => vec![
                "Wait For Line On Uart    x_value: 1.0*, y_value: 1.9*".to_string(),
                "Wait For Line On Uart    x_value: 3.0*, y_value: 0.0*".to_string(),
            ],
        }
    }
}
