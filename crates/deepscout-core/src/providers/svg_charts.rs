use std::fs;
use std::path::{Path, PathBuf};

use plotters::prelude::*;

use crate::agents::{ChartRenderer, ChartSpec};
use crate::config::ReporterConfig;
use crate::error::PipelineError;

/// Draws bar charts as SVG files under `<output_dir>/charts/`.
pub struct SvgChartRenderer {
    output_dir: PathBuf,
    size: (u32, u32),
}

impl SvgChartRenderer {
    pub fn new(config: &ReporterConfig) -> Self {
        Self::with_output_dir(&config.output_dir, (config.chart_width, config.chart_height))
    }

    pub fn with_output_dir(output_dir: &Path, size: (u32, u32)) -> Self {
        Self {
            output_dir: output_dir.to_path_buf(),
            size,
        }
    }

    fn draw(&self, spec: &ChartSpec, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
        let lower = spec.bars.iter().map(|(_, v)| *v).fold(0.0_f64, f64::min);
        let upper = spec.bars.iter().map(|(_, v)| *v).fold(0.0_f64, f64::max);
        let padding = ((upper - lower).abs() * 0.1).max(1.0);
        let y_range = lower.min(0.0)..upper + padding;
        let caption = match &spec.unit {
            Some(unit) => format!("{} ({unit})", spec.title),
            None => spec.title.clone(),
        };

        let root = SVGBackend::new(path, self.size).into_drawing_area();
        root.fill(&WHITE)?;

        let mut chart = ChartBuilder::on(&root)
            .margin(20)
            .caption(caption, ("sans-serif", 22))
            .x_label_area_size(30)
            .y_label_area_size(50)
            .build_cartesian_2d(0f64..spec.bars.len() as f64, y_range)?;

        chart
            .configure_mesh()
            .disable_x_mesh()
            .x_labels(spec.bars.len())
            .x_label_formatter(&|x| {
                let idx = (*x).floor() as usize;
                spec.bars.get(idx).map(|(label, _)| label.clone()).unwrap_or_default()
            })
            .draw()?;

        for (idx, (label, value)) in spec.bars.iter().enumerate() {
            let x = idx as f64;
            chart.draw_series(std::iter::once(Rectangle::new(
                [(x + 0.15, 0.0), (x + 0.85, *value)],
                BLUE.mix(0.6).filled(),
            )))?;
            chart.draw_series(std::iter::once(Text::new(
                format!("{label}: {value:.2}"),
                (x + 0.2, *value),
                ("sans-serif", 14).into_font(),
            )))?;
        }

        root.present()?;
        Ok(())
    }
}

impl ChartRenderer for SvgChartRenderer {
    fn render(&self, spec: &ChartSpec) -> Result<String, PipelineError> {
        if spec.bars.is_empty() {
            return Err(PipelineError::render_failed(&spec.chart_id, "no data to plot"));
        }
        if spec.bars.iter().any(|(_, v)| !v.is_finite()) {
            return Err(PipelineError::render_failed(&spec.chart_id, "non-finite value"));
        }

        let charts_dir = self.output_dir.join("charts");
        fs::create_dir_all(&charts_dir)
            .map_err(|err| PipelineError::render_failed(&spec.chart_id, err.to_string()))?;
        let file_name = format!("{}.svg", spec.chart_id);
        let path = charts_dir.join(&file_name);

        self.draw(spec, &path)
            .map_err(|err| PipelineError::render_failed(&spec.chart_id, err.to_string()))?;
        Ok(format!("charts/{file_name}"))
    }
}
